//! QEMU command-line assembly and child process ownership.
//!
//! The argument order matters to the guest firmware: base machine flags
//! first, then identity (UUID, RTC, SMBIOS), then the management NIC,
//! then the traffic NICs. Appliance variants compose their command line
//! through the `add_*` helpers so the shape stays uniform across families.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use rand::Rng;
use tracing::{debug, trace, warn};

pub const QEMU_BINARY: &str = "qemu-system-x86_64";

/// Network byte order length of a zero-padded two-digit NIC index; NIC `i`
/// listens on TCP `10000 + i`.
pub fn nic_port(index: u32) -> u32 {
    10_000 + index
}

/// Generate a random MAC address in the QEMU OUI space with the given last
/// octet. The last octet anchors the NIC's identity inside the VM; the random
/// middle bytes only avoid collisions across reboots.
pub fn gen_mac(last_octet: u8) -> String {
    let mut rng = rand::rng();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        rng.random::<u8>(),
        rng.random::<u8>(),
        last_octet
    )
}

/// Assembled configuration for one emulator invocation.
#[derive(Debug, Clone)]
pub struct QemuConfig {
    pub disk_image: Utf8PathBuf,
    pub ram_mb: u32,
    /// Chassis slot; selects the serial console port (`5000 + slot`).
    pub slot: u16,
    pub machine: Option<&'static str>,
    pub uuid: Option<String>,
    /// RTC base date (`YYYY-MM-DD`), used to fake the clock for licensing.
    pub rtc_base: Option<String>,
    pub smbios: Vec<String>,
    /// Pre-rendered `-device`/`-netdev` pairs, mgmt NICs first.
    nic_args: Vec<String>,
    kvm: bool,
}

impl QemuConfig {
    pub fn new(disk_image: impl Into<Utf8PathBuf>, ram_mb: u32, slot: u16) -> Self {
        Self {
            disk_image: disk_image.into(),
            ram_mb,
            slot,
            machine: None,
            uuid: None,
            rtc_base: None,
            smbios: Vec::new(),
            nic_args: Vec::new(),
            // hardware acceleration when the host exposes it
            kvm: Utf8Path::new("/dev/kvm").exists(),
        }
    }

    pub fn serial_port(&self) -> u16 {
        5000 + self.slot
    }

    /// NIC attached to a user-mode NAT on 10.0.0.0/24. `forwards` adds the
    /// SSH/NETCONF host forwards (container 2022 -> guest 22, 2830 -> 830);
    /// `tftp` exposes /tftpboot so the guest can fetch its license.
    pub fn add_user_nat_nic(&mut self, model: &str, id: &str, mac: &str, forwards: bool, tftp: bool) {
        let mut netdev = format!("user,id={id},net=10.0.0.0/24");
        if tftp {
            netdev.push_str(",tftp=/tftpboot");
        }
        if forwards {
            netdev.push_str(",hostfwd=tcp::2022-10.0.0.15:22,hostfwd=tcp::2830-10.0.0.15:830");
        }
        self.push_nic(model, id, mac, netdev);
    }

    /// NIC bridged to a host TAP interface. `script=no` because the
    /// supervisor does its own bridge membership management.
    pub fn add_tap_nic(&mut self, model: &str, id: &str, ifname: &str, mac: &str) {
        let netdev = format!("tap,ifname={ifname},id={id},script=no,downscript=no");
        self.push_nic(model, id, mac, netdev);
    }

    /// Traffic NIC `index`, exposed as a listening TCP socket on
    /// `10000 + index` for the cross-connect layer to join.
    pub fn add_socket_nic(&mut self, model: &str, index: u32, mac: &str) {
        let id = format!("p{index:02}");
        let netdev = format!("socket,id={id},listen=:{}", nic_port(index));
        self.push_nic(model, &id, mac, netdev);
    }

    /// Same as [`Self::add_socket_nic`] but placed on a specific PCI bridge;
    /// large appliances exceed the root bus's device count.
    pub fn add_socket_nic_on_bus(&mut self, model: &str, index: u32, mac: &str, bus: u32, addr: u32) {
        let id = format!("p{index:02}");
        self.nic_args.push("-device".into());
        self.nic_args
            .push(format!("{model},netdev={id},mac={mac},bus=pci.{bus},addr={addr:#x}"));
        self.nic_args.push("-netdev".into());
        self.nic_args
            .push(format!("socket,id={id},listen=:{}", nic_port(index)));
    }

    /// Raw `-device` entry (PCI bridges and the like).
    pub fn add_device(&mut self, device: String) {
        self.nic_args.push("-device".into());
        self.nic_args.push(device);
    }

    fn push_nic(&mut self, model: &str, id: &str, mac: &str, netdev: String) {
        self.nic_args.push("-device".into());
        self.nic_args.push(format!("{model},netdev={id},mac={mac}"));
        self.nic_args.push("-netdev".into());
        self.nic_args.push(netdev);
    }

    /// Render the full argument vector (without the binary name).
    pub fn to_args(&self) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        if self.kvm {
            args.push("-enable-kvm".into());
        }
        args.extend(["-display".into(), "none".into()]);
        if let Some(machine) = self.machine {
            args.extend(["-machine".into(), machine.into()]);
        }
        args.extend(["-m".into(), self.ram_mb.to_string()]);
        args.extend([
            "-serial".into(),
            format!("telnet:0.0.0.0:50{:02},server,nowait", self.slot),
        ]);
        args.extend(["-drive".into(), format!("if=ide,file={}", self.disk_image)]);
        if let Some(uuid) = &self.uuid {
            args.extend(["-uuid".into(), uuid.clone()]);
        }
        if let Some(rtc) = &self.rtc_base {
            args.extend(["-rtc".into(), format!("base={rtc}")]);
        }
        for e in &self.smbios {
            args.extend(["-smbios".into(), e.clone()]);
        }
        args.extend(self.nic_args.iter().cloned());
        args
    }
}

/// Result of a health probe on the emulator process.
pub enum EmulatorHealth {
    Running,
    Exited(ExitStatus),
    /// The emulator wrote to stderr; it is still alive but considered
    /// broken (bad drive, TAP failure, port clash) and should be restarted.
    ErrorOutput(String),
}

/// A spawned emulator. The child handle lives here so the owning VM can
/// probe, terminate, or kill it; dropping the handle kills a still-running
/// emulator so no process outlives its VM.
pub struct RunningQemu {
    child: Child,
    stderr: File,
    stderr_pos: u64,
}

impl RunningQemu {
    pub fn spawn(config: &QemuConfig) -> Result<Self> {
        let args = config.to_args();
        debug!("qemu args: {args:?}");
        let stdout = tempfile::tempfile()?;
        let stderr = tempfile::tempfile()?;
        let child = Command::new(QEMU_BINARY)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(stderr.try_clone()?)
            .spawn()
            .context("spawning qemu")?;
        Ok(Self {
            child,
            stderr,
            stderr_pos: 0,
        })
    }

    /// Non-blocking health probe: has the process exited, and has it written
    /// anything new to stderr since the last probe?
    pub fn poll(&mut self) -> Result<EmulatorHealth> {
        if let Some(status) = self.child.try_wait().context("waiting for qemu")? {
            return Ok(EmulatorHealth::Exited(status));
        }
        let new_output = self.read_new_stderr()?;
        if !new_output.trim().is_empty() {
            return Ok(EmulatorHealth::ErrorOutput(new_output));
        }
        Ok(EmulatorHealth::Running)
    }

    fn read_new_stderr(&mut self) -> Result<String> {
        self.stderr.seek(SeekFrom::Start(self.stderr_pos))?;
        let mut buf = Vec::new();
        let n = self.stderr.read_to_end(&mut buf)?;
        self.stderr_pos += n as u64;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Request graceful termination, then kill after `grace`.
    pub fn terminate(&mut self, grace: Duration) -> Result<()> {
        match kill(Pid::from_raw(self.child.id() as i32), Signal::SIGTERM) {
            Ok(()) => {}
            Err(nix::errno::Errno::ESRCH) => {
                let _ = self.child.wait();
                return Ok(());
            }
            Err(e) => warn!("SIGTERM to qemu failed: {e}"),
        }
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self.child.try_wait().context("waiting for qemu")?.is_some() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(200));
        }
        trace!("qemu did not exit after SIGTERM, killing");
        self.child.kill().ok();
        self.child.wait().context("reaping qemu")?;
        Ok(())
    }
}

impl Drop for RunningQemu {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            self.child.kill().ok();
            self.child.wait().ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gen_mac_has_qemu_oui_and_last_octet() {
        for k in [0u8, 1, 5, 128, 255] {
            let mac = gen_mac(k);
            assert!(mac.starts_with("52:54:00:"), "{mac}");
            assert_eq!(mac.len(), 17);
            let last = u8::from_str_radix(&mac[15..], 16).unwrap();
            assert_eq!(last, k);
        }
    }

    #[test]
    fn nic_ports_follow_the_port_map() {
        assert_eq!(nic_port(1), 10001);
        assert_eq!(nic_port(36), 10036);
        assert_eq!(nic_port(128), 10128);
    }

    #[test]
    fn base_args_shape() {
        let mut cfg = QemuConfig::new("/sros.qcow2", 6144, 0);
        cfg.kvm = false;
        let args = cfg.to_args();
        assert_eq!(
            args,
            vec![
                "-display",
                "none",
                "-m",
                "6144",
                "-serial",
                "telnet:0.0.0.0:5000,server,nowait",
                "-drive",
                "if=ide,file=/sros.qcow2",
            ]
        );
    }

    #[test]
    fn kvm_flag_leads_when_enabled() {
        let mut cfg = QemuConfig::new("/sros.qcow2", 6144, 0);
        cfg.kvm = true;
        assert_eq!(cfg.to_args()[0], "-enable-kvm");
    }

    #[test]
    fn slot_selects_serial_port() {
        let cfg = QemuConfig::new("/sros.qcow2", 6144, 3);
        assert_eq!(cfg.serial_port(), 5003);
        assert!(cfg
            .to_args()
            .contains(&"telnet:0.0.0.0:5003,server,nowait".to_string()));
    }

    #[test]
    fn identity_args_follow_base() {
        let mut cfg = QemuConfig::new("/sros.qcow2", 6144, 0);
        cfg.kvm = false;
        cfg.uuid = Some("00000000-0000-0000-0000-000000000000".into());
        cfg.rtc_base = Some("2017-07-05".into());
        cfg.smbios.push("type=1,product=TIMOS:slot=A".into());
        let args = cfg.to_args();
        let uuid_at = args.iter().position(|a| a == "-uuid").unwrap();
        assert_eq!(args[uuid_at + 1], "00000000-0000-0000-0000-000000000000");
        let rtc_at = args.iter().position(|a| a == "-rtc").unwrap();
        assert_eq!(args[rtc_at + 1], "base=2017-07-05");
        let smbios_at = args.iter().position(|a| a == "-smbios").unwrap();
        assert!(uuid_at < rtc_at && rtc_at < smbios_at);
    }

    #[test]
    fn mgmt_nat_nic_renders_forwards_and_tftp() {
        let mut cfg = QemuConfig::new("/sros.qcow2", 6144, 0);
        cfg.add_user_nat_nic("e1000", "p00", "52:54:00:aa:bb:00", true, true);
        let args = cfg.to_args();
        assert!(args.contains(&"e1000,netdev=p00,mac=52:54:00:aa:bb:00".to_string()));
        let netdev = "user,id=p00,net=10.0.0.0/24,tftp=/tftpboot,\
                      hostfwd=tcp::2022-10.0.0.15:22,hostfwd=tcp::2830-10.0.0.15:830";
        assert!(args.contains(&netdev.to_string()));
    }

    #[test]
    fn bare_mgmt_nat_has_no_forwards() {
        let mut cfg = QemuConfig::new("/sros.qcow2", 6144, 1);
        cfg.add_user_nat_nic("e1000", "mgmt", "52:54:00:aa:bb:00", false, false);
        assert!(cfg
            .to_args()
            .contains(&"user,id=mgmt,net=10.0.0.0/24".to_string()));
    }

    #[test]
    fn socket_nic_is_zero_padded_and_port_mapped() {
        let mut cfg = QemuConfig::new("/sros.qcow2", 6144, 0);
        cfg.add_socket_nic("e1000", 7, "52:54:00:aa:bb:07");
        let args = cfg.to_args();
        assert!(args.contains(&"e1000,netdev=p07,mac=52:54:00:aa:bb:07".to_string()));
        assert!(args.contains(&"socket,id=p07,listen=:10007".to_string()));
    }

    #[test]
    fn socket_nic_on_bus_carries_pci_placement() {
        let mut cfg = QemuConfig::new("/xrv.vmdk", 4096, 0);
        cfg.add_socket_nic_on_bus("e1000", 27, "52:54:00:aa:bb:1b", 2, 1);
        let args = cfg.to_args();
        assert!(args.contains(&"e1000,netdev=p27,mac=52:54:00:aa:bb:1b,bus=pci.2,addr=0x1".to_string()));
        assert!(args.contains(&"socket,id=p27,listen=:10027".to_string()));
    }

    #[test]
    fn tap_nic_disables_ifup_scripts() {
        let mut cfg = QemuConfig::new("/sros.qcow2", 6144, 0);
        cfg.add_tap_nic("e1000", "vcp-int", "vcp-int", "52:54:00:aa:bb:01");
        assert!(cfg
            .to_args()
            .contains(&"tap,ifname=vcp-int,id=vcp-int,script=no,downscript=no".to_string()));
    }
}
