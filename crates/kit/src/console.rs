//! Serial console access to an emulated router.
//!
//! QEMU exposes each VM's serial port as a telnet server on
//! `127.0.0.1:5000+slot`. The bootstrap state machines drive the console
//! through [`SerialConsole::expect`] (pattern match with timeout) and
//! [`SerialConsole::wait_write`] (prompt-then-command), the same dialogue
//! primitives a human would use over telnet.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::{Duration, Instant};

use color_eyre::eyre::{Context, Result};
use tracing::{debug, trace};

/// Granularity of the socket read timeout inside `expect`; short enough that
/// the overall deadline is honored to within a fraction of a second.
const READ_SLICE: Duration = Duration::from_millis(250);

pub struct SerialConsole {
    stream: TcpStream,
    /// Bytes read but not yet consumed by a match.
    buf: Vec<u8>,
    iac: IacFilter,
}

impl SerialConsole {
    /// Connect to the serial console at `127.0.0.1:<port>`, retrying until
    /// `timeout` elapses. The emulator opens the telnet listener during its
    /// own startup, so the first attempts may be refused.
    pub fn connect(port: u16, timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        loop {
            match TcpStream::connect(("127.0.0.1", port)) {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    debug!("connected to serial console on port {port}");
                    return Ok(Self {
                        stream,
                        buf: Vec::new(),
                        iac: IacFilter::default(),
                    });
                }
                Err(e) if Instant::now() < deadline => {
                    trace!("serial console on port {port} not ready: {e}");
                    std::thread::sleep(Duration::from_millis(250));
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("connecting to serial console on port {port}"))
                }
            }
        }
    }

    /// Wait up to `timeout` for any of `patterns` (literal byte substrings)
    /// to appear on the console.
    ///
    /// On a match, returns `(Some(index), matched_bytes, preceding_bytes)`
    /// where `preceding_bytes` is everything read before the match; the
    /// unread remainder stays buffered for the next call. On timeout,
    /// returns `(None, empty, accumulated_bytes)` so the caller can log the
    /// output and reset its idle counter. Bytes are never dropped.
    pub fn expect(
        &mut self,
        patterns: &[&[u8]],
        timeout: Duration,
    ) -> Result<(Option<usize>, Vec<u8>, Vec<u8>)> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some((idx, pos, len)) = self.find_earliest(patterns) {
                let rest = self.buf.split_off(pos + len);
                let mut consumed = std::mem::replace(&mut self.buf, rest);
                let matched = consumed.split_off(pos);
                return Ok((Some(idx), matched, consumed));
            }

            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                break;
            };
            self.stream
                .set_read_timeout(Some(remaining.min(READ_SLICE)))?;
            let mut chunk = [0u8; 4096];
            match self.stream.read(&mut chunk) {
                // Peer closed; whatever is buffered is all we will ever get.
                Ok(0) => break,
                Ok(n) => self.iac.filter_into(&chunk[..n], &mut self.buf),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) => return Err(e).context("reading from serial console"),
            }
        }
        let accumulated = std::mem::take(&mut self.buf);
        Ok((None, Vec::new(), accumulated))
    }

    /// Block until `token` is seen or the peer closes; returns everything
    /// read up to and including the token.
    pub fn read_until(&mut self, token: &[u8]) -> Result<Vec<u8>> {
        loop {
            if let Some(pos) = find(&self.buf, token) {
                let rest = self.buf.split_off(pos + token.len());
                return Ok(std::mem::replace(&mut self.buf, rest));
            }
            self.stream.set_read_timeout(None)?;
            let mut chunk = [0u8; 4096];
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(std::mem::take(&mut self.buf)),
                Ok(n) => self.iac.filter_into(&chunk[..n], &mut self.buf),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e).context("reading from serial console"),
            }
        }
    }

    /// Send `s` followed by a carriage return; no waiting.
    pub fn write_line(&mut self, s: &str) -> Result<()> {
        debug!("writing to serial console: {s}");
        self.stream
            .write_all(format!("{s}\r").as_bytes())
            .context("writing to serial console")
    }

    /// Wait for `wait` on the console (if given), then send `cmd`.
    pub fn wait_write(&mut self, cmd: &str, wait: Option<&str>) -> Result<()> {
        if let Some(w) = wait {
            trace!("waiting for '{w}' on serial console");
            let res = self.read_until(w.as_bytes())?;
            trace!("read from serial console: {}", String::from_utf8_lossy(&res));
        }
        self.write_line(cmd)
    }

    pub fn close(self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    /// Earliest match across all patterns; ties broken by pattern order.
    fn find_earliest(&self, patterns: &[&[u8]]) -> Option<(usize, usize, usize)> {
        let mut best: Option<(usize, usize, usize)> = None;
        for (idx, p) in patterns.iter().enumerate() {
            if p.is_empty() {
                continue;
            }
            if let Some(pos) = find(&self.buf, p) {
                if best.map_or(true, |(_, bpos, _)| pos < bpos) {
                    best = Some((idx, pos, p.len()));
                }
            }
        }
        best
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Strips telnet IAC command sequences from the byte stream. QEMU's telnet
/// server negotiates options on connect; we ignore the negotiation entirely
/// and only keep the data bytes.
#[derive(Default)]
struct IacFilter {
    state: IacState,
}

#[derive(Default, Clone, Copy, PartialEq)]
enum IacState {
    #[default]
    Data,
    Iac,
    Option,
    Subneg,
    SubnegIac,
}

const IAC: u8 = 255;
const SE: u8 = 240;
const SB: u8 = 250;

impl IacFilter {
    fn filter_into(&mut self, input: &[u8], out: &mut Vec<u8>) {
        for &b in input {
            self.state = match (self.state, b) {
                (IacState::Data, IAC) => IacState::Iac,
                (IacState::Data, _) => {
                    out.push(b);
                    IacState::Data
                }
                // escaped literal 0xff
                (IacState::Iac, IAC) => {
                    out.push(IAC);
                    IacState::Data
                }
                (IacState::Iac, SB) => IacState::Subneg,
                // WILL/WONT/DO/DONT carry one option byte
                (IacState::Iac, 251..=254) => IacState::Option,
                (IacState::Iac, _) => IacState::Data,
                (IacState::Option, _) => IacState::Data,
                (IacState::Subneg, IAC) => IacState::SubnegIac,
                (IacState::Subneg, _) => IacState::Subneg,
                (IacState::SubnegIac, SE) => IacState::Data,
                (IacState::SubnegIac, _) => IacState::Subneg,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::net::TcpListener;
    use std::thread;

    fn console_pair() -> (SerialConsole, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || listener.accept().unwrap().0);
        let console = SerialConsole::connect(port, Duration::from_secs(5)).unwrap();
        (console, server.join().unwrap())
    }

    #[test]
    fn expect_matches_and_returns_preceding() {
        let (mut console, mut peer) = console_pair();
        peer.write_all(b"boot messages...\r\nLogin: ").unwrap();

        let (idx, matched, preceding) = console
            .expect(&[b"Login:", b"#"], Duration::from_secs(5))
            .unwrap();
        assert_eq!(idx, Some(0));
        assert_eq!(matched, b"Login:");
        assert_eq!(preceding, b"boot messages...\r\n");
    }

    #[test]
    fn expect_earliest_pattern_wins() {
        let (mut console, mut peer) = console_pair();
        peer.write_all(b"router# Login:").unwrap();

        let (idx, matched, _) = console
            .expect(&[b"Login:", b"#"], Duration::from_secs(5))
            .unwrap();
        assert_eq!(idx, Some(1));
        assert_eq!(matched, b"#");

        // the rest of the stream is still there for the next call
        let (idx, matched, preceding) = console
            .expect(&[b"Login:", b"#"], Duration::from_secs(5))
            .unwrap();
        assert_eq!(idx, Some(0));
        assert_eq!(matched, b"Login:");
        assert_eq!(preceding, b" ");
    }

    #[test]
    fn expect_timeout_returns_accumulated_output() {
        let (mut console, mut peer) = console_pair();
        peer.write_all(b"still booting").unwrap();

        let (idx, matched, res) = console
            .expect(&[b"Login:"], Duration::from_millis(600))
            .unwrap();
        assert_eq!(idx, None);
        assert!(matched.is_empty());
        assert_eq!(res, b"still booting");

        // and a quiet timeout returns nothing
        let (idx, _, res) = console
            .expect(&[b"Login:"], Duration::from_millis(300))
            .unwrap();
        assert_eq!(idx, None);
        assert!(res.is_empty());
    }

    #[test]
    fn read_until_returns_through_token() {
        let (mut console, mut peer) = console_pair();
        peer.write_all(b"some output\r\nrouter# ").unwrap();

        let res = console.read_until(b"#").unwrap();
        assert_eq!(res, b"some output\r\nrouter#");
    }

    #[test]
    fn write_line_appends_carriage_return() {
        let (mut console, mut peer) = console_pair();
        console.write_line("admin").unwrap();

        let mut buf = [0u8; 16];
        let n = peer.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"admin\r");
    }

    #[test]
    fn telnet_negotiation_is_stripped() {
        let (mut console, mut peer) = console_pair();
        // IAC WILL ECHO, IAC SB ... IAC SE, escaped 0xff, then data
        peer.write_all(&[255, 251, 1, 255, 250, 31, 0, 80, 255, 240, 255, 255])
            .unwrap();
        peer.write_all(b"Login: ").unwrap();

        let (idx, _, preceding) = console
            .expect(&[b"Login:"], Duration::from_secs(5))
            .unwrap();
        assert_eq!(idx, Some(0));
        assert_eq!(preceding, &[255][..]);
    }
}
