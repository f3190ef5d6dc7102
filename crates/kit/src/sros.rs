//! SR OS virtual router family.
//!
//! Up to five NICs fit in a single integrated VM. Beyond that the appliance
//! runs distributed: one control-plane VM plus one line-card VM per six
//! NICs, all joined over an internal L2 segment (`int_cp` bridge on the
//! host) that the guests use as their fabric.

use std::process::Command;

use camino::Utf8Path;
use clap::Parser;
use color_eyre::eyre::{eyre, Context, Result};
use tracing::{debug, info};

use crate::command_run::{check_required_binaries, CommandRun};
use crate::console::SerialConsole;
use crate::license::{self, License, LICENSE_PATH};
use crate::qemu::{gen_mac, QemuConfig, QEMU_BINARY};
use crate::supervisor::Supervisor;
use crate::vm::{Appliance, BootStatus, Vm};

pub const DISK_IMAGE: &str = "/sros.qcow2";
pub const INT_CP_BRIDGE: &str = "int_cp";

const NIC_MODEL: &str = "e1000";
const RAM_MB: u32 = 6144;
const NULL_UUID: &str = "00000000-0000-0000-0000-000000000000";

/// Run the SR OS virtual router supervisor.
#[derive(Parser, Debug, Clone)]
pub struct SrosOpts {
    #[clap(long, help = "Enable trace level logging")]
    pub trace: bool,

    #[clap(long, default_value = "vrnetlab", help = "Username to configure")]
    pub username: String,

    #[clap(long, default_value = "VR-netlab9", help = "Password to configure")]
    pub password: String,

    #[clap(long, default_value_t = 5, help = "Number of NICs")]
    pub num_nics: u32,

    #[clap(long, help = "Use new chassis generation (SR-1, SR-14s)")]
    pub newchassis: bool,
}

/// Which VM set a given NIC count maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentPlan {
    Integrated,
    Distributed { num_lc: u32 },
}

/// Decide between integrated and distributed mode. Distributed mode is a
/// licensed feature; refusing to start without one beats booting a chassis
/// that can never come up.
pub fn plan_vms(num_nics: u32, license_present: bool) -> Result<DeploymentPlan> {
    if num_nics > 5 {
        if !license_present {
            return Err(eyre!(
                "More than 5 NICs require distributed VSR which requires a license \
                 but no license is found"
            ));
        }
        Ok(DeploymentPlan::Distributed {
            num_lc: num_nics.div_ceil(6),
        })
    } else {
        Ok(DeploymentPlan::Integrated)
    }
}

pub fn run(opts: SrosOpts) -> Result<()> {
    check_required_binaries(&[QEMU_BINARY, "socat", "brctl", "ip"])?;
    std::fs::create_dir_all("/tftpboot").context("creating /tftpboot")?;
    sweep_artifacts(Utf8Path::new("/"), Utf8Path::new(DISK_IMAGE), Utf8Path::new(LICENSE_PATH))?;

    let license = license::read(Utf8Path::new(LICENSE_PATH))?;
    info!("Number of NICs: {}", opts.num_nics);
    let plan = plan_vms(opts.num_nics, license.is_present())?;

    // bridge for connecting the control plane with the line cards
    Command::new("brctl")
        .args(["addbr", INT_CP_BRIDGE])
        .run_logged();
    Command::new("ip")
        .args(["link", "set", INT_CP_BRIDGE, "up"])
        .run_logged();

    Supervisor::new(build_vms(&opts, plan, license)).run()
}

/// Move whatever disk image and license the container was built with into
/// their canonical paths.
pub(crate) fn sweep_artifacts(
    root: &Utf8Path,
    disk_dest: &Utf8Path,
    license_dest: &Utf8Path,
) -> Result<()> {
    for entry in root.read_dir_utf8().with_context(|| format!("reading {root}"))? {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        if path.as_str().ends_with(".qcow2") && path != disk_dest {
            debug!("moving {path} to {disk_dest}");
            std::fs::rename(path, disk_dest)?;
        } else if path.as_str().ends_with(".license") {
            debug!("moving {path} to {license_dest}");
            std::fs::rename(path, license_dest)?;
        }
    }
    Ok(())
}

fn build_vms(opts: &SrosOpts, plan: DeploymentPlan, license: License) -> Vec<Vm> {
    match plan {
        DeploymentPlan::Integrated => vec![Vm::new(Appliance::SrosIntegrated(Integrated {
            username: opts.username.clone(),
            password: opts.password.clone(),
            newchassis: opts.newchassis,
            license,
        }))],
        DeploymentPlan::Distributed { num_lc } => {
            info!("Number of linecards: {num_lc}");
            let mut vms = vec![Vm::new(Appliance::SrosControlPlane(ControlPlane {
                username: opts.username.clone(),
                password: opts.password.clone(),
                newchassis: opts.newchassis,
                num_lc,
                license: license.clone(),
            }))];
            for slot in 1..=num_lc {
                vms.push(Vm::new(Appliance::SrosLineCard(LineCard {
                    slot: slot as u16,
                    newchassis: opts.newchassis,
                    license: license.clone(),
                })));
            }
            vms
        }
    }
}

pub(crate) const SROS_PATTERNS: &[&[u8]] = &[b"Login:", b"#"];

/// Shared SR OS console handling: log in with the appliance's factory
/// credentials if the login prompt appeared, then send the bootstrap
/// configuration line by line, waiting for the prompt between commands.
fn login_and_configure(
    idx: usize,
    console: &mut SerialConsole,
    lines: &[String],
) -> Result<BootStatus> {
    if idx == 0 {
        debug!("matched login prompt");
        console.write_line("admin")?;
        console.wait_write("admin", Some("Password:"))?;
    }
    for line in lines {
        console.wait_write(line, Some("#"))?;
    }
    Ok(BootStatus::Complete)
}

fn security_lines(username: &str, password: &str) -> Vec<String> {
    vec![
        format!("configure system security user \"{username}\" password {password}"),
        format!("configure system security user \"{username}\" access console netconf"),
        format!("configure system security user \"{username}\" console member \"administrative\" \"default\""),
        "configure system netconf no shutdown".into(),
        "configure system security profile \"administrative\" netconf base-op-authorization lock"
            .into(),
    ]
}

fn base_config(license: &License, slot: u16, smbios: String) -> QemuConfig {
    let mut cfg = QemuConfig::new(DISK_IMAGE, RAM_MB, slot);
    cfg.uuid = Some(license.uuid.clone().unwrap_or_else(|| NULL_UUID.into()));
    cfg.rtc_base = license.rtc_base.clone();
    cfg.smbios.push(smbios);
    cfg
}

fn enslave_into_bridge(ifname: &str) {
    Command::new("brctl")
        .args(["addif", INT_CP_BRIDGE, ifname])
        .run_logged();
    Command::new("ip")
        .args(["link", "set", ifname, "up"])
        .run_logged();
    // fabric frames are jumbo; the default 1500 would truncate them
    Command::new("ip")
        .args(["link", "set", "dev", ifname, "mtu", "10000"])
        .run_logged();
}

/// Integrated VSR-SIM: one VM carries both control plane and forwarding.
pub struct Integrated {
    pub username: String,
    pub password: String,
    pub newchassis: bool,
    pub license: License,
}

impl Integrated {
    pub const NUM_NICS: u32 = 5;

    pub fn qemu_config(&self) -> QemuConfig {
        let smbios = if self.newchassis {
            "type=1,product=TIMOS:address=10.0.0.15/24@active \
             license-file=tftp://10.0.0.2/license.txt slot=A chassis=SR-1 \
             card=iom-1 mda/1=me6-100gb-qsfp28"
        } else {
            "type=1,product=TIMOS:address=10.0.0.15/24@active \
             license-file=tftp://10.0.0.2/license.txt slot=A chassis=SR-c12 \
             card=cfm-xp-b mda/1=m20-1gb-xp-sfp"
        };
        let mut cfg = base_config(&self.license, 0, smbios.into());
        cfg.add_user_nat_nic(NIC_MODEL, "p00", &gen_mac(0), true, true);
        // fake NIC; the integrated chassis expects a second port to exist
        cfg.add_tap_nic(NIC_MODEL, "dummy0", "dummy0", &gen_mac(1));
        for i in 1..Self::NUM_NICS {
            cfg.add_socket_nic(NIC_MODEL, i, &gen_mac(i as u8));
        }
        cfg
    }

    pub fn bootstrap_lines(&self) -> Vec<String> {
        let mut lines = security_lines(&self.username, &self.password);
        lines.extend([
            "configure card 1 mda 1 shutdown".to_string(),
            "configure card 1 mda 1 no mda-type".into(),
            "configure card 1 shutdown".into(),
            "configure card 1 no card-type".into(),
        ]);
        if self.newchassis {
            lines.extend([
                "configure card 1 card-type iom-1 level he".to_string(),
                "configure card 1 mda 1 mda-type me6-100gb-qsfp28".into(),
            ]);
        } else {
            lines.extend([
                "configure card 1 card-type iom-xp-b".to_string(),
                "configure card 1 mcm 1 mcm-type mcm-xp".into(),
                "configure card 1 mda 1 mda-type m20-1gb-xp-sfp".into(),
            ]);
        }
        lines.extend([
            "configure card 1 no shutdown".to_string(),
            "admin save".into(),
            "logout".into(),
        ]);
        lines
    }

    pub fn handle_match(&mut self, idx: usize, console: &mut SerialConsole) -> Result<BootStatus> {
        login_and_configure(idx, console, &self.bootstrap_lines())
    }
}

/// Control plane VM of a distributed VSR-SIM.
pub struct ControlPlane {
    pub username: String,
    pub password: String,
    pub newchassis: bool,
    pub num_lc: u32,
    pub license: License,
}

impl ControlPlane {
    pub fn qemu_config(&self) -> QemuConfig {
        let smbios = if self.newchassis {
            "type=1,product=TIMOS:address=10.0.0.15/24@active \
             license-file=tftp://10.0.0.2/license.txt chassis=SR-14s slot=A \
             sfm=sfm-s card=cpm-s"
        } else {
            "type=1,product=TIMOS:address=10.0.0.15/24@active \
             license-file=tftp://10.0.0.2/license.txt chassis=XRS-20 \
             chassis-topology=XRS-40 slot=A sfm=sfm-x20-b card=cpm-x20"
        };
        let mut cfg = base_config(&self.license, 0, smbios.into());
        cfg.add_user_nat_nic(NIC_MODEL, "p00", &gen_mac(0), true, true);
        // fabric-facing NIC; the supervisor enslaves the TAP into int_cp
        cfg.add_tap_nic(NIC_MODEL, "vcp-int", "vcp-int", &gen_mac(1));
        cfg
    }

    pub fn post_start(&self) {
        enslave_into_bridge("vcp-int");
    }

    pub fn bootstrap_lines(&self) -> Vec<String> {
        let mut lines = security_lines(&self.username, &self.password);
        if self.newchassis {
            for shelf in 1..3 {
                lines.push(format!(
                    "configure system power-shelf {shelf} power-shelf-type ps-a10-shelf-dc"
                ));
                for module in 1..11 {
                    lines.push(format!(
                        "configure system power-shelf {shelf} power-module {module} \
                         power-module-type ps-a-dc-6000"
                    ));
                }
            }
            for sfm in 1..9 {
                lines.push(format!("configure sfm {sfm} sfm-type sfm-s"));
            }
        } else {
            for sfm in 1..17 {
                lines.push(format!("configure sfm {sfm} sfm-type sfm-x20-b"));
            }
            // declare every line card so the control plane knows what to
            // expect when the line-card VMs join the fabric
            for card in 1..=self.num_lc {
                lines.push(format!("configure card {card} card-type xcm-x20"));
                lines.push(format!("configure card {card} mda 1 mda-type cx20-10g-sfp"));
            }
        }
        lines.extend(["admin save".to_string(), "logout".into()]);
        lines
    }

    pub fn handle_match(&mut self, idx: usize, console: &mut SerialConsole) -> Result<BootStatus> {
        login_and_configure(idx, console, &self.bootstrap_lines())
    }
}

/// Line card VM of a distributed VSR-SIM. No console dialogue: the control
/// plane configures it over the fabric once it joins the bridge.
pub struct LineCard {
    pub slot: u16,
    pub newchassis: bool,
    pub license: License,
}

impl LineCard {
    pub const NUM_NICS: u32 = 6;

    pub fn qemu_config(&self) -> QemuConfig {
        let smbios = if self.newchassis {
            format!(
                "type=1,product=TIMOS:chassis=SR-14s slot={} sfm=sfm-s \
                 card=xcm-14s mda/1=s36-400gb-qsfpdd",
                self.slot
            )
        } else {
            format!(
                "type=1,product=TIMOS:chassis=XRS-20 chassis-topology=XRS-40 \
                 slot={} sfm=sfm-x20-b card=xcm-x20 mda/1=cx20-10g-sfp",
                self.slot
            )
        };
        let mut cfg = base_config(&self.license, self.slot, smbios);
        cfg.add_user_nat_nic(NIC_MODEL, "mgmt", &gen_mac(0), false, false);
        cfg.add_tap_nic(
            NIC_MODEL,
            "vfpc-int",
            &format!("vfpc{}-int", self.slot),
            &gen_mac(0),
        );
        // slots partition the traffic port space without overlap
        let offset = Self::NUM_NICS * (self.slot as u32 - 1);
        for j in 0..Self::NUM_NICS {
            let i = offset + j + 1;
            cfg.add_socket_nic(NIC_MODEL, i, &gen_mac(i as u8));
        }
        cfg
    }

    pub fn post_start(&self) {
        enslave_into_bridge(&format!("vfpc{}-int", self.slot));
    }
}
