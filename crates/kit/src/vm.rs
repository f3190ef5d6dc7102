//! One emulated appliance: owns the emulator child process and the serial
//! console, and drives the console-based bootstrap state machine.
//!
//! Supervision is cooperative: the supervisor calls [`Vm::work`] in a loop
//! and each call does one bounded unit of progress (a ~1 s console poll at
//! most), so several VMs boot in round-robin from a single thread.

use std::time::{Duration, Instant};

use color_eyre::eyre::Result;
use tracing::{debug, info, trace, warn};

use crate::console::SerialConsole;
use crate::qemu::{EmulatorHealth, QemuConfig, RunningQemu};
use crate::sros::{ControlPlane, Integrated, LineCard};
use crate::xrv::XrRouter;

/// How long to wait for the emulator's telnet listener after spawn.
const CONSOLE_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Grace period between SIGTERM and SIGKILL on stop.
const STOP_GRACE: Duration = Duration::from_secs(10);
/// Console poll window per bootstrap spin.
const SPIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle of a supervised VM.
///
/// `Unstarted -> Booting` on the first supervision tick, `Booting ->
/// Running` when the bootstrap state machine completes, `Booting ->
/// Unstarted` on watchdog reset, `* -> Stopped` on explicit stop. `Running`
/// is sticky until the emulator dies or is restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Unstarted,
    Booting,
    Running,
    Stopped,
}

/// Outcome of one bootstrap state-machine step.
pub enum BootStatus {
    InProgress,
    /// Bootstrap script fully sent; the VM counts as running.
    Complete,
    /// The state machine cannot make progress (e.g. out of credentials);
    /// restart the VM.
    Failed,
}

/// The appliance families, dispatched over a tag rather than inheritance.
/// Each variant carries its own data and supplies the pieces the generic VM
/// skeleton needs: command line, console patterns, and match handling.
pub enum Appliance {
    SrosIntegrated(Integrated),
    SrosControlPlane(ControlPlane),
    SrosLineCard(LineCard),
    XrRouter(XrRouter),
}

impl Appliance {
    pub fn name(&self) -> String {
        match self {
            Appliance::SrosIntegrated(_) => "sros-integrated".into(),
            Appliance::SrosControlPlane(_) => "sros-cp".into(),
            Appliance::SrosLineCard(lc) => format!("sros-lc{}", lc.slot),
            Appliance::XrRouter(_) => "xrv".into(),
        }
    }

    pub fn qemu_config(&self) -> QemuConfig {
        match self {
            Appliance::SrosIntegrated(a) => a.qemu_config(),
            Appliance::SrosControlPlane(a) => a.qemu_config(),
            Appliance::SrosLineCard(a) => a.qemu_config(),
            Appliance::XrRouter(a) => a.qemu_config(),
        }
    }

    /// Host-side plumbing to run once the emulator is up (bridge membership
    /// for the internal control-plane segment).
    pub fn post_start(&self) {
        match self {
            Appliance::SrosControlPlane(a) => a.post_start(),
            Appliance::SrosLineCard(a) => a.post_start(),
            _ => {}
        }
    }

    /// Idle console polls tolerated before the watchdog restarts the VM.
    pub fn spin_threshold(&self) -> u32 {
        match self {
            Appliance::XrRouter(_) => 300,
            _ => 60,
        }
    }

    /// Console patterns this variant reacts to; empty means the variant has
    /// no bootstrap dialogue at all.
    pub fn patterns(&self) -> &'static [&'static [u8]] {
        match self {
            Appliance::SrosIntegrated(_) | Appliance::SrosControlPlane(_) => {
                crate::sros::SROS_PATTERNS
            }
            Appliance::SrosLineCard(_) => &[],
            Appliance::XrRouter(_) => crate::xrv::XR_PATTERNS,
        }
    }

    /// Reset per-boot state before (re)starting the emulator.
    pub fn prepare_boot(&mut self) {
        if let Appliance::XrRouter(a) = self {
            a.prepare_boot();
        }
    }

    pub fn handle_match(
        &mut self,
        idx: usize,
        console: &mut SerialConsole,
    ) -> Result<BootStatus> {
        match self {
            Appliance::SrosIntegrated(a) => a.handle_match(idx, console),
            Appliance::SrosControlPlane(a) => a.handle_match(idx, console),
            Appliance::SrosLineCard(_) => Ok(BootStatus::Complete),
            Appliance::XrRouter(a) => a.handle_match(idx, console),
        }
    }
}

pub struct Vm {
    name: String,
    appliance: Appliance,
    qemu: Option<RunningQemu>,
    console: Option<SerialConsole>,
    state: VmState,
    spins: u32,
    start_time: Option<Instant>,
}

impl Vm {
    pub fn new(appliance: Appliance) -> Self {
        Self {
            name: appliance.name(),
            appliance,
            qemu: None,
            console: None,
            state: VmState::Unstarted,
            spins: 0,
            start_time: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn running(&self) -> bool {
        self.state == VmState::Running
    }

    /// One supervision tick: make sure the emulator is healthy, then run a
    /// bootstrap spin if the VM has not reached `Running` yet.
    pub fn work(&mut self) -> Result<()> {
        self.check_emulator()?;
        if self.state == VmState::Booting {
            self.bootstrap_spin()?;
        }
        Ok(())
    }

    fn check_emulator(&mut self) -> Result<()> {
        let Some(qemu) = self.qemu.as_mut() else {
            return self.start();
        };
        match qemu.poll()? {
            EmulatorHealth::Running => Ok(()),
            EmulatorHealth::Exited(status) => {
                warn!(vm = %self.name, "emulator exited ({status}), restarting");
                self.restart()
            }
            EmulatorHealth::ErrorOutput(out) => {
                warn!(vm = %self.name, "emulator error output, restarting: {}", out.trim());
                self.restart()
            }
        }
    }

    fn start(&mut self) -> Result<()> {
        info!(vm = %self.name, "starting");
        self.appliance.prepare_boot();
        let config = self.appliance.qemu_config();
        let qemu = RunningQemu::spawn(&config)?;
        self.qemu = Some(qemu);
        self.console = Some(SerialConsole::connect(
            config.serial_port(),
            CONSOLE_CONNECT_TIMEOUT,
        )?);
        self.appliance.post_start();
        self.state = VmState::Booting;
        self.spins = 0;
        self.start_time = Some(Instant::now());
        Ok(())
    }

    fn restart(&mut self) -> Result<()> {
        self.stop()?;
        self.start()
    }

    /// Stop the emulator: SIGTERM, bounded wait, then SIGKILL.
    pub fn stop(&mut self) -> Result<()> {
        self.state = VmState::Stopped;
        if let Some(console) = self.console.take() {
            console.close();
        }
        if let Some(mut qemu) = self.qemu.take() {
            qemu.terminate(STOP_GRACE)?;
        }
        Ok(())
    }

    fn bootstrap_spin(&mut self) -> Result<()> {
        if self.spins > self.appliance.spin_threshold() {
            // too many spins with no result, probably means the appliance
            // never started successfully, so we restart it
            warn!(vm = %self.name, "no output from serial console, restarting VM");
            self.stop()?;
            self.state = VmState::Unstarted;
            self.spins = 0;
            return Ok(());
        }

        let patterns = self.appliance.patterns();
        if patterns.is_empty() {
            // no dialogue for this variant; opening and closing the console
            // is the whole boot
            self.complete_boot();
            return Ok(());
        }

        let Some(console) = self.console.as_mut() else {
            return Ok(());
        };
        let (idx, matched, preceding) = console.expect(patterns, SPIN_TIMEOUT)?;
        if let Some(idx) = idx {
            debug!(
                vm = %self.name,
                "matched {:?}",
                String::from_utf8_lossy(&matched)
            );
            match self.appliance.handle_match(idx, console)? {
                BootStatus::Complete => {
                    self.complete_boot();
                    return Ok(());
                }
                BootStatus::Failed => {
                    warn!(vm = %self.name, "bootstrap failed, restarting VM");
                    self.stop()?;
                    self.state = VmState::Unstarted;
                    self.spins = 0;
                    return Ok(());
                }
                BootStatus::InProgress => {}
            }
        } else if !preceding.is_empty() {
            trace!(vm = %self.name, "OUTPUT: {}", String::from_utf8_lossy(&preceding));
            // output means the appliance is still booting; give it more time
            self.spins = 0;
        }
        self.spins += 1;
        Ok(())
    }

    fn complete_boot(&mut self) {
        if let Some(console) = self.console.take() {
            console.close();
        }
        if let Some(started) = self.start_time {
            info!(vm = %self.name, "startup complete in: {:?}", started.elapsed());
        }
        self.state = VmState::Running;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::license::License;

    fn integrated() -> Appliance {
        Appliance::SrosIntegrated(Integrated {
            username: "alice".into(),
            password: "s3cr3t".into(),
            newchassis: false,
            license: License::default(),
        })
    }

    #[test]
    fn new_vm_is_unstarted_and_not_running() {
        let vm = Vm::new(integrated());
        assert_eq!(vm.state(), VmState::Unstarted);
        assert!(!vm.running());
        assert_eq!(vm.name(), "sros-integrated");
    }

    #[test]
    fn spin_thresholds_per_family() {
        assert_eq!(integrated().spin_threshold(), 60);
        let xr = Appliance::XrRouter(XrRouter::new("alice".into(), "s3cr3t".into()));
        assert_eq!(xr.spin_threshold(), 300);
    }

    #[test]
    fn line_card_has_no_dialogue() {
        let lc = Appliance::SrosLineCard(LineCard {
            slot: 1,
            newchassis: false,
            license: License::default(),
        });
        assert!(lc.patterns().is_empty());
        assert_eq!(lc.name(), "sros-lc1");
    }
}
