//! Supervision loop over a set of VMs, plus the `/health` liveness file
//! consumed by outside orchestration.

use std::process::{Child, Command};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{Context, Result};
use tracing::{debug, warn};

use crate::command_run::CommandRun;
use crate::vm::Vm;

pub const HEALTH_PATH: &str = "/health";

/// Minimum supervision pass duration. Booting VMs pace the loop through
/// their 1 s console polls; this keeps the loop from spinning hot once
/// everything is up.
const TICK: Duration = Duration::from_secs(1);

/// Single-line `<code> <message>` liveness file, overwritten every pass.
pub struct HealthFile {
    path: Utf8PathBuf,
}

impl HealthFile {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn update(&self, code: u8, message: &str) -> Result<()> {
        std::fs::write(&self.path, format!("{code} {message}"))
            .with_context(|| format!("writing {}", self.path))
    }
}

/// Health line for one supervision pass. `started_once` distinguishes a
/// chassis that is still coming up from one that has regressed.
pub fn health_status(all_running: bool, started_once: bool) -> (u8, &'static str) {
    if all_running {
        (0, "running")
    } else if started_once {
        (1, "VM failed - restarting")
    } else {
        (1, "starting")
    }
}

pub struct Supervisor {
    vms: Vec<Vm>,
    health: HealthFile,
    relays: Vec<Child>,
    started_once: bool,
}

impl Supervisor {
    /// VM order is fixed for the lifetime of the supervisor; the control
    /// plane is stepped before its line cards.
    pub fn new(vms: Vec<Vm>) -> Self {
        Self::with_health_path(vms, Utf8Path::new(HEALTH_PATH))
    }

    pub fn with_health_path(vms: Vec<Vm>, health: &Utf8Path) -> Self {
        Self {
            vms,
            health: HealthFile::new(health),
            relays: Vec::new(),
            started_once: false,
        }
    }

    /// Run the supervision loop forever.
    pub fn run(&mut self) -> Result<()> {
        debug!("starting supervision of {} VM(s)", self.vms.len());
        self.spawn_relays()?;
        loop {
            self.tick()?;
        }
    }

    /// Expose the management forwards on the container's own ports so
    /// external clients reach SSH and NETCONF uniformly.
    fn spawn_relays(&mut self) -> Result<()> {
        for (listen, target) in [(22, 2022), (830, 2830)] {
            let child = Command::new("socat")
                .args([
                    format!("TCP-LISTEN:{listen},fork"),
                    format!("TCP:127.0.0.1:{target}"),
                ])
                .spawn_background()?;
            self.relays.push(child);
        }
        Ok(())
    }

    fn tick(&mut self) -> Result<()> {
        let pass_start = Instant::now();

        let mut all_running = true;
        for vm in &mut self.vms {
            if let Err(e) = vm.work() {
                warn!(vm = %vm.name(), state = ?vm.state(), "supervision error: {e:#}");
            }
            if !vm.running() {
                all_running = false;
            }
        }

        let (code, message) = health_status(all_running, self.started_once);
        if all_running {
            self.started_once = true;
        }
        self.health.update(code, message)?;

        // reap relay children so a crashed socat doesn't linger as a zombie
        for relay in &mut self.relays {
            if let Ok(Some(status)) = relay.try_wait() {
                warn!("management relay exited: {status}");
            }
        }

        if let Some(remaining) = TICK.checked_sub(pass_start.elapsed()) {
            std::thread::sleep(remaining);
        }
        Ok(())
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        for vm in &mut self.vms {
            let _ = vm.stop();
        }
        for relay in &mut self.relays {
            relay.kill().ok();
            relay.wait().ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_transitions_starting_running_failed() {
        assert_eq!(health_status(false, false), (1, "starting"));
        assert_eq!(health_status(true, false), (0, "running"));
        // sticky after the first all-running pass
        assert_eq!(health_status(true, true), (0, "running"));
        assert_eq!(health_status(false, true), (1, "VM failed - restarting"));
    }

    #[test]
    fn health_file_is_overwritten_each_update() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("health")).unwrap();
        let health = HealthFile::new(path.clone());

        health.update(1, "starting").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1 starting");

        health.update(0, "running").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "0 running");
    }
}
