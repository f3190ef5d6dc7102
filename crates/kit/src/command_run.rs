use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::process::{Child, Command, Stdio};

use color_eyre::eyre::{eyre, Context, Result};
use tracing::trace;

/// Cap on how much captured stderr makes it into an error message; a chatty
/// tool would otherwise drown the log.
const STDERR_TAIL_BYTES: u64 = 1024;

/// Helpers intended for [`std::process::Command`].
pub trait CommandRun {
    /// Execute the child process and wait for it to exit; a non-zero exit
    /// becomes an error carrying the tail of the child's stderr.
    fn run(&mut self) -> Result<()>;

    /// Execute the child process and capture its stdout as a string. Uses
    /// `run` internally, so abnormal exits are errors here too.
    fn run_get_string(&mut self) -> Result<String>;

    /// Execute the child process, absorbing any failure. The captured stdout
    /// is returned on success; spawn failures and non-zero exits are logged
    /// and surfaced as `None`. Host-plumbing commands (bridge and link setup)
    /// go through this path so a failure degrades a feature instead of
    /// killing the supervisor.
    fn run_logged(&mut self) -> Option<String>;

    /// Spawn the child process detached; the caller keeps the handle and is
    /// responsible for reaping it.
    fn spawn_background(&mut self) -> Result<Child>;
}

impl CommandRun for Command {
    fn run(&mut self) -> Result<()> {
        let mut stderr = tempfile::tempfile()?;
        self.stderr(stderr.try_clone()?);
        trace!("exec: {self:?}");
        let status = self.status()?;
        if status.success() {
            return Ok(());
        }
        Err(eyre!(
            "command exited with {status}\n{}",
            stderr_tail(&mut stderr)
        ))
    }

    fn run_get_string(&mut self) -> Result<String> {
        let mut stdout = tempfile::tempfile()?;
        self.stdout(stdout.try_clone()?);
        self.run()?;
        stdout.seek(SeekFrom::Start(0)).context("seek")?;
        let mut s = String::new();
        stdout.read_to_string(&mut s)?;
        Ok(s)
    }

    fn run_logged(&mut self) -> Option<String> {
        match self.run_get_string() {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!("command {self:?} failed: {e:#}");
                None
            }
        }
    }

    fn spawn_background(&mut self) -> Result<Child> {
        trace!("spawn: {self:?}");
        self.stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("spawning {self:?}"))
    }
}

/// Last kilobyte of a captured stderr file, lossily decoded. The command
/// itself is left out of the message; callers add it where it helps.
fn stderr_tail(f: &mut File) -> String {
    let len = match f.metadata() {
        Ok(m) => m.len(),
        Err(_) => return "<stderr unavailable>".into(),
    };
    let mut buf = Vec::new();
    let seek_read = f
        .seek(SeekFrom::Start(len.saturating_sub(STDERR_TAIL_BYTES)))
        .and_then(|_| f.read_to_end(&mut buf));
    match seek_read {
        Ok(_) => String::from_utf8_lossy(&buf).into_owned(),
        Err(_) => "<stderr unavailable>".into(),
    }
}

/// Verify that the external tools a subcommand shells out to are present
/// before doing any work, so a missing binary surfaces as one clear error.
pub fn check_required_binaries(required: &[&str]) -> Result<()> {
    let missing: Vec<String> = required
        .iter()
        .filter(|binary| which::which(binary).is_err())
        .map(|binary| format!("Missing required executable: {binary}"))
        .collect();

    if !missing.is_empty() {
        return Err(eyre!("{}", missing.join("\n")));
    }

    tracing::debug!("All required binaries found");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn run_get_string_captures_stdout() {
        let out = Command::new("echo").arg("hello").run_get_string().unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn run_fails_on_nonzero_exit() {
        assert!(Command::new("false").run().is_err());
    }

    #[test]
    fn run_error_carries_stderr() {
        let err = Command::new("sh")
            .args(["-c", "echo boom >&2; exit 3"])
            .run()
            .unwrap_err();
        assert!(format!("{err}").contains("boom"));
    }

    #[test]
    fn run_logged_absorbs_failure() {
        assert!(Command::new("false").run_logged().is_none());
        assert!(Command::new("/nonexistent/binary").run_logged().is_none());
    }

    #[test]
    fn spawn_background_returns_live_child() {
        let mut child = Command::new("sleep").arg("5").spawn_background().unwrap();
        assert!(child.try_wait().unwrap().is_none());
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn stderr_tail_keeps_only_the_end() {
        let mut f = tempfile::tempfile().unwrap();
        let long = "x".repeat(4096);
        f.write_all(long.as_bytes()).unwrap();
        f.write_all(b"the end").unwrap();
        let tail = stderr_tail(&mut f);
        assert!(tail.len() <= STDERR_TAIL_BYTES as usize);
        assert!(tail.ends_with("the end"));
    }
}
