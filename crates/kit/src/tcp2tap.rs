//! Framed-TCP to raw-TAP bridge.
//!
//! One side is a TCP tunnel carrying `{u32 big-endian length, payload}`
//! records; the other is a kernel TAP device moving whole Ethernet frames
//! per read/write. The wire format is fixed and must stay bit-exact: it is
//! what the emulated NIC sockets speak.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsFd;
use std::os::unix::io::AsRawFd;

use color_eyre::eyre::{eyre, Context, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, warn};

use crate::xcon::READ_LIMIT;

/// A TAP-mode tun device with no packet-info header.
pub struct TapDevice {
    file: File,
    name: String,
}

impl TapDevice {
    /// Allocate a TAP interface with the requested name via TUNSETIFF.
    pub fn open(name: &str) -> Result<Self> {
        if name.len() >= libc::IFNAMSIZ {
            return Err(eyre!("TAP interface name '{name}' is too long"));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")
            .context("opening /dev/net/tun")?;

        let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
        for (dst, src) in req.ifr_name.iter_mut().zip(name.as_bytes()) {
            *dst = *src as libc::c_char;
        }
        req.ifr_ifru.ifru_flags = (libc::IFF_TAP | libc::IFF_NO_PI) as libc::c_short;

        let rc = unsafe { libc::ioctl(file.as_raw_fd(), libc::TUNSETIFF, &mut req) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("TUNSETIFF for {name}"));
        }
        Ok(Self {
            file,
            name: name.to_string(),
        })
    }
}

/// Two-state framer over the tunnel byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FramerState {
    ReadingSize,
    ReadingPayload { remaining: usize },
}

pub(crate) struct Framer {
    state: FramerState,
}

impl Framer {
    pub(crate) fn new() -> Self {
        Self {
            state: FramerState::ReadingSize,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.state = FramerState::ReadingSize;
    }

    /// Consume as many complete records from `buf` as possible, handing
    /// each payload to `sink`. Partial headers and partial payloads stay in
    /// `buf` for the next pass.
    pub(crate) fn drain<F>(&mut self, buf: &mut Vec<u8>, mut sink: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        loop {
            match self.state {
                FramerState::ReadingSize => {
                    if buf.len() < 4 {
                        break;
                    }
                    let size = u32::from_be_bytes(buf[..4].try_into().expect("4 bytes")) as usize;
                    buf.drain(..4);
                    debug!("reading size - pkt size: {size}");
                    self.state = FramerState::ReadingPayload { remaining: size };
                }
                FramerState::ReadingPayload { remaining } => {
                    if buf.len() < remaining {
                        break;
                    }
                    let payload: Vec<u8> = buf.drain(..remaining).collect();
                    self.state = FramerState::ReadingSize;
                    sink(&payload)?;
                }
            }
        }
        Ok(())
    }
}

pub struct Tcp2Tap {
    listener: TcpListener,
    /// At most one tunnel client at a time; a new accept replaces it.
    client: Option<TcpStream>,
    tap: TapDevice,
    tcp_buf: Vec<u8>,
    framer: Framer,
}

impl Tcp2Tap {
    pub fn new(tap_if: &str, listen_port: u16) -> Result<Self> {
        // IPv6 wildcard; v4 clients arrive as v4-mapped addresses
        let listener = TcpListener::bind(format!("[::]:{listen_port}"))
            .with_context(|| format!("listening on [::]:{listen_port}"))?;
        let tap = TapDevice::open(tap_if)?;
        info!(
            "tunnel listening on [::]:{listen_port}, bridging to tap interface {}",
            tap.name
        );
        Ok(Self {
            listener,
            client: None,
            tap,
            tcp_buf: Vec::new(),
            framer: Framer::new(),
        })
    }

    pub fn run(&mut self) -> Result<()> {
        loop {
            self.tick()?;
        }
    }

    fn tick(&mut self) -> Result<()> {
        let (listener_ready, tap_ready, client_ready) = {
            let mut fds = vec![
                PollFd::new(self.listener.as_fd(), PollFlags::POLLIN),
                PollFd::new(self.tap.file.as_fd(), PollFlags::POLLIN),
            ];
            if let Some(client) = &self.client {
                fds.push(PollFd::new(client.as_fd(), PollFlags::POLLIN));
            }
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => return Ok(()),
                Err(e) => return Err(e).context("polling tunnel sockets"),
            }
            let ready = |fd: &PollFd<'_>| {
                fd.revents().is_some_and(|r| {
                    r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
                })
            };
            (ready(&fds[0]), ready(&fds[1]), fds.get(2).map_or(false, ready))
        };

        if listener_ready {
            self.accept_client()?;
        }
        if client_ready {
            self.pump_tunnel()?;
        }
        if tap_ready {
            self.pump_tap()?;
        }
        Ok(())
    }

    fn accept_client(&mut self) -> Result<()> {
        let (stream, addr) = self.listener.accept().context("accepting tunnel client")?;
        debug!("received incoming TCP connection from {addr}, setting up!");
        stream.set_nodelay(true).ok();
        if self.client.replace(stream).is_some() {
            warn!("replacing existing tunnel client");
            self.drop_frame_in_progress();
        }
        Ok(())
    }

    /// Tunnel bytes in, frames out to the TAP.
    fn pump_tunnel(&mut self) -> Result<()> {
        let mut chunk = [0u8; READ_LIMIT];
        let read = match self.client.as_mut() {
            None => return Ok(()),
            Some(client) => client.read(&mut chunk),
        };
        let n = match read {
            Ok(0) => {
                warn!("connection dropped");
                self.client = None;
                self.drop_frame_in_progress();
                return Ok(());
            }
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
            Err(e) => {
                warn!("connection dropped: {e}");
                self.client = None;
                self.drop_frame_in_progress();
                return Ok(());
            }
        };
        self.tcp_buf.extend_from_slice(&chunk[..n]);
        debug!(
            "read {n} bytes from tcp, tcp_buf length {}",
            self.tcp_buf.len()
        );

        let Self {
            tap,
            tcp_buf,
            framer,
            ..
        } = self;
        framer.drain(tcp_buf, |payload| {
            tap.file
                .write_all(payload)
                .context("writing frame to tap interface")
        })
    }

    /// One TAP read is one whole Ethernet frame; prefix it and tunnel it.
    fn pump_tap(&mut self) -> Result<()> {
        let mut frame = [0u8; READ_LIMIT];
        let n = self
            .tap
            .file
            .read(&mut frame)
            .context("reading from tap interface")?;

        let Some(client) = self.client.as_mut() else {
            warn!("received packet from tap interface but TCP not connected, discarding packet");
            return Ok(());
        };

        let mut buf = Vec::with_capacity(4 + n);
        buf.extend_from_slice(&(n as u32).to_be_bytes());
        buf.extend_from_slice(&frame[..n]);
        if let Err(e) = client.write_all(&buf) {
            warn!("tunnel client write failed, dropping client: {e}");
            self.client = None;
            self.drop_frame_in_progress();
        }
        Ok(())
    }

    fn drop_frame_in_progress(&mut self) {
        self.tcp_buf.clear();
        self.framer.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_all(framer: &mut Framer, buf: &mut Vec<u8>) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        framer
            .drain(buf, |payload| {
                frames.push(payload.to_vec());
                Ok(())
            })
            .unwrap();
        frames
    }

    #[test]
    fn parses_a_single_record() {
        let mut framer = Framer::new();
        let mut buf = vec![0x00, 0x00, 0x00, 0x04, 0xDE, 0xAD, 0xBE, 0xEF];
        let frames = drain_all(&mut framer, &mut buf);
        assert_eq!(frames, vec![vec![0xDE, 0xAD, 0xBE, 0xEF]]);
        assert!(buf.is_empty());
    }

    #[test]
    fn header_split_across_segments_is_handled() {
        let mut framer = Framer::new();
        let mut buf = vec![0x00];
        assert!(drain_all(&mut framer, &mut buf).is_empty());
        assert_eq!(buf.len(), 1);

        buf.extend_from_slice(&[0x00, 0x00, 0x02]);
        // header complete, payload not yet arrived
        assert!(drain_all(&mut framer, &mut buf).is_empty());
        assert!(buf.is_empty());

        buf.extend_from_slice(&[0xAA, 0xBB]);
        assert_eq!(drain_all(&mut framer, &mut buf), vec![vec![0xAA, 0xBB]]);
    }

    #[test]
    fn payload_split_across_segments_is_handled() {
        let mut framer = Framer::new();
        let mut buf = vec![0x00, 0x00, 0x00, 0x03, 0x01];
        assert!(drain_all(&mut framer, &mut buf).is_empty());
        assert_eq!(buf, vec![0x01]);

        buf.extend_from_slice(&[0x02, 0x03]);
        assert_eq!(drain_all(&mut framer, &mut buf), vec![vec![0x01, 0x02, 0x03]]);
    }

    #[test]
    fn multiple_records_in_one_segment() {
        let mut framer = Framer::new();
        let mut buf = vec![
            0x00, 0x00, 0x00, 0x01, 0xAA, //
            0x00, 0x00, 0x00, 0x02, 0xBB, 0xCC, //
            0x00, 0x00, 0x00, 0x01, // header of an incomplete record
        ];
        let frames = drain_all(&mut framer, &mut buf);
        assert_eq!(frames, vec![vec![0xAA], vec![0xBB, 0xCC]]);
        assert!(buf.is_empty());
    }

    #[test]
    fn byte_conservation_across_arbitrary_chunking() {
        // stream of three records, fed one byte at a time
        let mut stream = Vec::new();
        for payload in [&b"a"[..], &b"hello"[..], &b"\x00\x01\x02"[..]] {
            stream.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            stream.extend_from_slice(payload);
        }

        let mut framer = Framer::new();
        let mut buf = Vec::new();
        let mut emitted = Vec::new();
        for b in &stream {
            buf.push(*b);
            framer
                .drain(&mut buf, |payload| {
                    emitted.push(payload.to_vec());
                    Ok(())
                })
                .unwrap();
        }
        assert_eq!(emitted, vec![b"a".to_vec(), b"hello".to_vec(), b"\x00\x01\x02".to_vec()]);
        // every received byte was either emitted or consumed as a header
        assert!(buf.is_empty());
    }

    #[test]
    fn zero_length_record_is_passed_through() {
        let mut framer = Framer::new();
        let mut buf = vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0xFF];
        let frames = drain_all(&mut framer, &mut buf);
        assert_eq!(frames, vec![Vec::<u8>::new(), vec![0xFF]]);
    }

    #[test]
    fn reset_discards_a_frame_in_progress() {
        let mut framer = Framer::new();
        let mut buf = vec![0x00, 0x00, 0x00, 0x10, 0x01, 0x02];
        assert!(drain_all(&mut framer, &mut buf).is_empty());

        framer.reset();
        buf.clear();
        buf.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0xAB]);
        assert_eq!(drain_all(&mut framer, &mut buf), vec![vec![0xAB]]);
    }
}
