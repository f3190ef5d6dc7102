//! Integration tests for vrkit
//!
//! These drive the built binary; point `VRKIT_PATH` at it. Tests that need
//! a router image or TAP privileges are out of scope here and live in the
//! container CI instead.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use camino::Utf8Path;
use color_eyre::eyre::{eyre, Context, Result};
use libtest_mimic::{Arguments, Trial};
use xshell::{cmd, Shell};

/// Get the path to the vrkit binary, checking VRKIT_PATH env var first,
/// then falling back to "vrkit"
fn get_vrkit_command() -> Result<String> {
    if let Some(path) = std::env::var("VRKIT_PATH").ok() {
        return Ok(path);
    }
    // Force the user to set this if we're running from the project dir
    if let Some(path) = ["target/debug/vrkit", "target/release/vrkit"]
        .into_iter()
        .find(|p| Utf8Path::new(p).exists())
    {
        return Err(eyre!(
            "Detected {path} - set VRKIT_PATH={path} to run using this binary"
        ));
    }
    Ok("vrkit".to_owned())
}

/// Kills the child when the test is done with it, passed or failed.
struct KillOnDrop(Child);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        self.0.kill().ok();
        self.0.wait().ok();
    }
}

fn test_help_smoke() -> Result<()> {
    let sh = Shell::new()?;
    let vrkit = get_vrkit_command()?;

    for subcommand in ["sros", "xrv", "xcon"] {
        let out = cmd!(sh, "{vrkit} {subcommand} --help").read()?;
        if !out.contains("Usage") {
            return Err(eyre!("unexpected --help output for {subcommand}: {out}"));
        }
    }
    Ok(())
}

fn test_xcon_rejects_both_modes() -> Result<()> {
    let vrkit = get_vrkit_command()?;
    let status = Command::new(&vrkit)
        .args(["xcon", "--p2p", "r1/1--r2/1", "--tap-listen", "1"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .context("running vrkit")?;
    if status.success() {
        return Err(eyre!("--p2p together with --tap-listen should be rejected"));
    }
    Ok(())
}

fn test_xcon_rejects_unresolvable_router() -> Result<()> {
    let vrkit = get_vrkit_command()?;
    let output = Command::new(&vrkit)
        .args(["xcon", "--p2p", "no-such-router.invalid/1--r2.invalid/1"])
        .output()
        .context("running vrkit")?;
    if output.status.success() {
        return Err(eyre!("unresolvable router names should be fatal"));
    }
    Ok(())
}

/// End to end: two local listeners stand in for emulated NIC sockets, the
/// bridge joins them, and bytes written on one side come out the other.
/// Closing one side and bringing it back exercises the reconnect path.
fn test_xcon_p2p_forwards_and_reconnects() -> Result<()> {
    let vrkit = get_vrkit_command()?;

    // NIC sockets for 127.0.0.1/81 and 127.0.0.1/82
    let left = TcpListener::bind("127.0.0.1:10081").context("binding 10081")?;
    let right = TcpListener::bind("127.0.0.1:10082").context("binding 10082")?;

    let child = Command::new(&vrkit)
        .args(["xcon", "--debug", "--p2p", "127.0.0.1/81--127.0.0.1/82"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("spawning vrkit xcon")?;
    let _child = KillOnDrop(child);

    let (mut left_conn, _) = left.accept().context("accepting on left")?;
    let (mut right_conn, _) = right.accept().context("accepting on right")?;
    right_conn.set_read_timeout(Some(Duration::from_secs(10)))?;

    left_conn.write_all(b"\x00\x00\x00\x04ping")?;
    let mut got = [0u8; 8];
    right_conn
        .read_exact(&mut got)
        .context("reading forwarded bytes")?;
    if &got != b"\x00\x00\x00\x04ping" {
        return Err(eyre!("forwarded bytes mangled: {got:?}"));
    }

    // Take the right router down and bring it back; the bridge should
    // reconnect lazily and deliver subsequent bytes.
    drop(right_conn);
    drop(right);
    std::thread::sleep(Duration::from_millis(500));
    let right = TcpListener::bind("127.0.0.1:10082").context("rebinding 10082")?;
    right.set_nonblocking(true)?;

    let deadline = Instant::now() + Duration::from_secs(30);
    let mut reconnected: Option<TcpStream> = None;
    while Instant::now() < deadline {
        left_conn.write_all(b"\x00\x00\x00\x02hi")?;
        if reconnected.is_none() {
            if let Ok((conn, _)) = right.accept() {
                conn.set_read_timeout(Some(Duration::from_secs(5)))?;
                conn.set_nonblocking(false)?;
                reconnected = Some(conn);
            }
        }
        if let Some(conn) = reconnected.as_mut() {
            let mut byte = [0u8; 1];
            match conn.read(&mut byte) {
                Ok(n) if n > 0 => return Ok(()),
                _ => {}
            }
        }
        std::thread::sleep(Duration::from_millis(200));
    }
    Err(eyre!("bridge did not reconnect within 30s"))
}

fn main() {
    // Integration tests are only supported on Linux
    if std::env::consts::OS != "linux" {
        eprintln!(
            "Integration tests are only supported on Linux (current OS: {})",
            std::env::consts::OS
        );
        eprintln!("Skipping all integration tests.");
        std::process::exit(0);
    }

    let args = Arguments::from_args();

    let tests = vec![
        Trial::test("help_smoke", || {
            test_help_smoke().map_err(|e| format!("{e:?}").into())
        }),
        Trial::test("xcon_rejects_both_modes", || {
            test_xcon_rejects_both_modes().map_err(|e| format!("{e:?}").into())
        }),
        Trial::test("xcon_rejects_unresolvable_router", || {
            test_xcon_rejects_unresolvable_router().map_err(|e| format!("{e:?}").into())
        }),
        Trial::test("xcon_p2p_forwards_and_reconnects", || {
            test_xcon_p2p_forwards_and_reconnects().map_err(|e| format!("{e:?}").into())
        }),
    ];

    libtest_mimic::run(&args, tests).exit();
}
