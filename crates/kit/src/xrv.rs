//! IOS XR virtual router family.
//!
//! A single VM, but with a much longer boot dialogue than SR OS: the
//! appliance asks for an initial root-system user, logs a configuration
//! completion banner, and only then accepts the bootstrap configuration.
//! Login credentials rotate: known factory defaults are tried first, then
//! whatever the initial-user dialogue just created.

use std::process::Command;

use camino::Utf8Path;
use clap::Parser;
use color_eyre::eyre::{Context, Result};
use tracing::{debug, info, warn};

use crate::command_run::check_required_binaries;
use crate::console::SerialConsole;
use crate::qemu::{gen_mac, QemuConfig, QEMU_BINARY};
use crate::supervisor::Supervisor;
use crate::vm::{Appliance, BootStatus, Vm};

pub const DISK_IMAGE: &str = "/xrv.vmdk";

const NIC_MODEL: &str = "e1000";
const RAM_MB: u32 = 4096;
const NUM_NICS: u32 = 128;
/// e1000 NICs per PCI bridge; the root bus can't hold 128 devices.
const NICS_PER_PCI_BUS: u32 = 26;
const PCI_BRIDGES: u32 = 6;

/// Run the IOS XR virtual router supervisor.
#[derive(Parser, Debug, Clone)]
pub struct XrvOpts {
    #[clap(long, help = "Enable trace level logging")]
    pub trace: bool,

    #[clap(long, default_value = "vrnetlab", help = "Username to configure")]
    pub username: String,

    #[clap(long, default_value = "VR-netlab9", help = "Password to configure")]
    pub password: String,
}

pub fn run(opts: XrvOpts) -> Result<()> {
    check_required_binaries(&[QEMU_BINARY, "socat"])?;
    sweep_disk_image(Utf8Path::new("/"), Utf8Path::new(DISK_IMAGE))?;
    let vm = Vm::new(Appliance::XrRouter(XrRouter::new(
        opts.username,
        opts.password,
    )));
    Supervisor::new(vec![vm]).run()
}

pub(crate) fn sweep_disk_image(root: &Utf8Path, disk_dest: &Utf8Path) -> Result<()> {
    for entry in root.read_dir_utf8().with_context(|| format!("reading {root}"))? {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        if path.as_str().ends_with(".vmdk") && path != disk_dest {
            debug!("moving {path} to {disk_dest}");
            std::fs::rename(path, disk_dest)?;
        }
    }
    Ok(())
}

pub(crate) const XR_PATTERNS: &[&[u8]] = &[
    b"Press RETURN to get started",
    b"SYSTEM CONFIGURATION COMPLETE",
    b"Enter root-system username",
    b"Username:",
    b"#",
];

pub struct XrRouter {
    username: String,
    password: String,
    /// Login attempts in order; refilled on every (re)boot.
    credentials: Vec<(String, String)>,
    xr_ready: bool,
}

impl XrRouter {
    pub fn new(username: String, password: String) -> Self {
        let mut vm = Self {
            username,
            password,
            credentials: Vec::new(),
            xr_ready: false,
        };
        vm.prepare_boot();
        vm
    }

    pub fn prepare_boot(&mut self) {
        self.credentials = vec![("admin".to_string(), "admin".to_string())];
        self.xr_ready = false;
    }

    pub fn qemu_config(&self) -> QemuConfig {
        let mut cfg = QemuConfig::new(DISK_IMAGE, RAM_MB, 0);
        cfg.machine = Some("pc");
        for n in 1..=PCI_BRIDGES {
            cfg.add_device(format!("pci-bridge,chassis_nr={n},id=pci.{n}"));
        }
        cfg.add_user_nat_nic(NIC_MODEL, "mgmt", &gen_mac(0), true, false);
        for i in 1..=NUM_NICS {
            let bus = (i - 1) / NICS_PER_PCI_BUS + 1;
            let addr = (i - 1) % NICS_PER_PCI_BUS + 1;
            cfg.add_socket_nic_on_bus(NIC_MODEL, i, &gen_mac(i as u8), bus, addr);
        }
        cfg
    }

    pub fn handle_match(&mut self, idx: usize, console: &mut SerialConsole) -> Result<BootStatus> {
        match idx {
            0 => {
                // press return to get started, so we press return!
                debug!("got 'press return to get started...'");
                console.write_line("")?;
            }
            1 => {
                info!(
                    "XR system configuration is complete, \
                     should be able to proceed with bootstrap configuration"
                );
                console.write_line("")?;
                self.xr_ready = true;
            }
            2 => {
                info!("creating initial user");
                console.write_line(&self.username)?;
                console.wait_write(&self.password, Some("Enter secret:"))?;
                console.wait_write(&self.password, Some("Enter secret again:"))?;
                self.credentials
                    .insert(0, (self.username.clone(), self.password.clone()));
            }
            3 => {
                debug!("matched login prompt");
                if self.credentials.is_empty() {
                    warn!("no more credentials to try");
                    return Ok(BootStatus::Failed);
                }
                let (username, password) = self.credentials.remove(0);
                debug!("trying to log in with {username} / {password}");
                console.write_line(&username)?;
                console.wait_write(&password, Some("Password:"))?;
            }
            _ if self.xr_ready => {
                info!("applying bootstrap configuration");
                console.write_line("")?;
                for line in self.bootstrap_lines() {
                    console.wait_write(&line, Some("#"))?;
                }
                return Ok(BootStatus::Complete);
            }
            _ => {}
        }
        Ok(BootStatus::InProgress)
    }

    pub fn bootstrap_lines(&self) -> Vec<String> {
        let mut lines = vec![
            // the embedded carriage return accepts the default modulus size
            "crypto key generate rsa\r".to_string(),
            "admin".into(),
            "configure".into(),
            format!("username {} group root-system", self.username),
            format!("username {} group cisco-support", self.username),
            format!("username {} secret {}", self.username, self.password),
            "commit".into(),
            "exit".into(),
            "exit".into(),
        ];
        lines.extend([
            "configure".to_string(),
            "ssh server v2".into(),
            // both the 5.1.1 and 5.3.3 spellings; the unknown one is
            // rejected harmlessly
            "ssh server netconf port 830".into(),
            "ssh server netconf vrf default".into(),
            "netconf agent ssh".into(),
            "netconf-yang agent ssh".into(),
            "xml agent tty".into(),
            "interface MgmtEth 0/0/CPU0/0".into(),
            "no shutdown".into(),
            "ipv4 address 10.0.0.15/24".into(),
            "exit".into(),
            "commit".into(),
            "exit".into(),
        ]);
        lines
    }

    #[cfg(test)]
    pub fn credential_queue(&self) -> &[(String, String)] {
        &self.credentials
    }
}
