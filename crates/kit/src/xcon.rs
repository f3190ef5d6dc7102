//! Cross-connect packet plane.
//!
//! Joins the TCP sockets that emulated traffic NICs listen on into a
//! topology. Point-to-point mode pairs two remote sockets per edge and
//! shuttles bytes between them; the TAP mode lives in [`crate::tcp2tap`].
//!
//! Forwarding is opaque: both ends of an edge speak the same
//! length-prefixed framing, and TCP preserves byte order within a stream,
//! so the bridge never needs to parse frames.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::fd::AsFd;
use std::time::Duration;

use clap::{ArgGroup, Parser};
use color_eyre::eyre::{eyre, Context, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, warn};

use crate::qemu::nic_port;
use crate::tcp2tap::Tcp2Tap;

/// Per-read ceiling; frames are never larger than one TAP read.
pub(crate) const READ_LIMIT: usize = 2048;

/// Run the cross-connect between virtual routers.
#[derive(Parser, Debug, Clone)]
#[command(group(ArgGroup::new("mode").required(true)))]
pub struct XconOpts {
    #[clap(long, help = "Enable debug logging")]
    pub debug: bool,

    #[clap(
        long,
        num_args = 1..,
        value_name = "EDGE",
        group = "mode",
        help = "Point-to-point link between virtual routers: host1/if1--host2/if2"
    )]
    pub p2p: Vec<String>,

    #[clap(
        long,
        value_name = "PORT_SUFFIX",
        group = "mode",
        help = "TAP to virtual router; listen on 10000+PORT_SUFFIX for the tunnel"
    )]
    pub tap_listen: Option<u16>,

    #[clap(
        long,
        default_value = "tap0",
        help = "Name of the TAP interface (use with --tap-listen)"
    )]
    pub tap_if: String,
}

pub fn run(opts: XconOpts) -> Result<()> {
    if let Some(suffix) = opts.tap_listen {
        Tcp2Tap::new(&opts.tap_if, 10_000 + suffix)?.run()
    } else {
        let mut bridge = TcpBridge::new();
        for edge in &opts.p2p {
            bridge
                .add_p2p(edge)
                .with_context(|| format!("adding edge {edge}; is the router started and linked?"))?;
        }
        bridge.run()
    }
}

/// One side of an edge: the NIC socket of `host/intf`, plus enough cached
/// addressing to reconnect it after a transport failure.
struct Endpoint {
    /// `router/interface`, for logs.
    label: String,
    host: String,
    port: u16,
    peer: usize,
    stream: Option<TcpStream>,
}

#[derive(Default)]
pub struct TcpBridge {
    endpoints: Vec<Endpoint>,
}

/// Split `host/intf` and map the interface number onto the traffic NIC
/// port space.
fn parse_endpoint(s: &str) -> Result<(String, u16)> {
    let (host, intf) = s
        .split_once('/')
        .ok_or_else(|| eyre!("malformed endpoint '{s}', expected host/interface"))?;
    let intf: u32 = intf
        .parse()
        .with_context(|| format!("interface in '{s}' is not a number"))?;
    let port = u16::try_from(nic_port(intf))
        .map_err(|_| eyre!("interface {intf} is out of the NIC port range"))?;
    Ok((host.to_string(), port))
}

impl TcpBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a point-to-point link `host1/if1--host2/if2`. Both endpoint
    /// names must resolve; actual connections are best-effort and retried
    /// by the main loop.
    pub fn add_p2p(&mut self, edge: &str) -> Result<()> {
        let (source, destination) = edge
            .split_once("--")
            .ok_or_else(|| eyre!("malformed edge '{edge}', expected src--dst"))?;

        let base = self.endpoints.len();
        let mut parsed = Vec::new();
        for (label, peer) in [(source, base + 1), (destination, base)] {
            let (host, port) = parse_endpoint(label)?;
            // resolve now so a typoed or unlinked router name fails fast
            (host.as_str(), port)
                .to_socket_addrs()
                .with_context(|| format!("Unable to resolve {host}"))?;
            parsed.push(Endpoint {
                label: label.to_string(),
                host,
                port,
                peer,
                stream: None,
            });
        }
        self.endpoints.extend(parsed);
        self.connect_endpoint(base);
        self.connect_endpoint(base + 1);
        Ok(())
    }

    pub fn run(&mut self) -> Result<()> {
        info!("bridging {} endpoint(s)", self.endpoints.len());
        loop {
            self.tick()?;
        }
    }

    /// One readiness pass: retry dead endpoints, wait for readable sockets,
    /// forward what arrived.
    pub(crate) fn tick(&mut self) -> Result<()> {
        for idx in 0..self.endpoints.len() {
            if self.endpoints[idx].stream.is_none() {
                self.connect_endpoint(idx);
            }
        }

        let readable: Vec<usize> = {
            let mut idxs = Vec::new();
            let mut fds = Vec::new();
            for (idx, ep) in self.endpoints.iter().enumerate() {
                if let Some(stream) = &ep.stream {
                    idxs.push(idx);
                    fds.push(PollFd::new(stream.as_fd(), PollFlags::POLLIN));
                }
            }
            if fds.is_empty() {
                std::thread::sleep(Duration::from_secs(1));
                return Ok(());
            }
            match poll(&mut fds, PollTimeout::from(1000u16)) {
                Ok(_) => {}
                Err(Errno::EINTR) => return Ok(()),
                Err(e) => return Err(e).context("polling bridge sockets"),
            }
            idxs.into_iter()
                .zip(&fds)
                .filter(|(_, fd)| {
                    fd.revents().is_some_and(|r| {
                        r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
                    })
                })
                .map(|(idx, _)| idx)
                .collect()
        };

        for idx in readable {
            self.forward(idx);
        }
        Ok(())
    }

    /// Move one read's worth of bytes from `idx` to its peer, reconnecting
    /// whichever side failed. Frames in flight during a failure are lost;
    /// the guests' own TCP stacks recover end to end.
    fn forward(&mut self, idx: usize) {
        let mut buf = [0u8; READ_LIMIT];
        let read = match self.endpoints[idx].stream.as_mut() {
            None => return,
            Some(stream) => stream.read(&mut buf),
        };
        let n = match read {
            Ok(0) => {
                warn!(
                    "connection closed by {}, reconnecting",
                    self.endpoints[idx].label
                );
                self.endpoints[idx].stream = None;
                self.connect_endpoint(idx);
                return;
            }
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::NotConnected) => {
                warn!(
                    "connection dropped, reconnecting to source {}",
                    self.endpoints[idx].label
                );
                self.endpoints[idx].stream = None;
                self.connect_endpoint(idx);
                return;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!("read error on {}: {e}", self.endpoints[idx].label);
                return;
            }
        };

        let peer = self.endpoints[idx].peer;
        debug!(
            "{:05} bytes {} -> {}",
            n, self.endpoints[idx].label, self.endpoints[peer].label
        );
        let write = match self.endpoints[peer].stream.as_mut() {
            Some(stream) => stream.write_all(&buf[..n]),
            None => {
                warn!(
                    "unable to send {:05} bytes {} -> {} due to remote being down, trying reconnect",
                    n, self.endpoints[idx].label, self.endpoints[peer].label
                );
                self.connect_endpoint(peer);
                return;
            }
        };
        if let Err(e) = write {
            warn!(
                "unable to send packet {:05} bytes {} -> {}, trying reconnect: {e}",
                n, self.endpoints[idx].label, self.endpoints[peer].label
            );
            self.endpoints[peer].stream = None;
            self.connect_endpoint(peer);
        }
    }

    /// Single connection attempt from the cached address; failures are
    /// logged and left for the next tick.
    fn connect_endpoint(&mut self, idx: usize) {
        let (host, port, label) = {
            let ep = &self.endpoints[idx];
            (ep.host.clone(), ep.port, ep.label.clone())
        };
        match TcpStream::connect((host.as_str(), port)) {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                debug!("connect to {label} successful");
                self.endpoints[idx].stream = Some(stream);
            }
            Err(e) => {
                info!("Unable to connect to {label}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn endpoint_maps_interface_onto_the_port_space() {
        assert_eq!(
            parse_endpoint("r1/1").unwrap(),
            ("r1".to_string(), 10001)
        );
        assert_eq!(
            parse_endpoint("example.com/36").unwrap(),
            ("example.com".to_string(), 10036)
        );
    }

    #[test]
    fn malformed_endpoints_are_rejected() {
        assert!(parse_endpoint("r1").is_err());
        assert!(parse_endpoint("r1/abc").is_err());
        assert!(parse_endpoint("r1/99999").is_err());
    }

    #[test]
    fn malformed_edge_is_rejected() {
        let mut bridge = TcpBridge::new();
        assert!(bridge.add_p2p("r1/1-r2/1").is_err());
    }

    #[test]
    fn unresolvable_router_is_rejected() {
        let mut bridge = TcpBridge::new();
        assert!(bridge
            .add_p2p("no-such-host.invalid/1--also-missing.invalid/1")
            .is_err());
    }

    #[test]
    fn bytes_flow_between_edge_endpoints() {
        // NIC sockets for interfaces 93 and 94 on localhost
        let left = TcpListener::bind("127.0.0.1:10093").unwrap();
        let right = TcpListener::bind("127.0.0.1:10094").unwrap();

        let mut bridge = TcpBridge::new();
        bridge.add_p2p("127.0.0.1/93--127.0.0.1/94").unwrap();

        let (mut left_conn, _) = left.accept().unwrap();
        let (mut right_conn, _) = right.accept().unwrap();

        left_conn.write_all(b"\x00\x00\x00\x04abcd").unwrap();
        bridge.tick().unwrap();

        right_conn
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut got = [0u8; 8];
        right_conn.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"\x00\x00\x00\x04abcd");
    }

    #[test]
    fn late_endpoint_is_picked_up_on_a_later_tick() {
        let left = TcpListener::bind("127.0.0.1:10095").unwrap();
        // interface 96 is not listening yet: the initial connect fails

        let mut bridge = TcpBridge::new();
        bridge.add_p2p("127.0.0.1/95--127.0.0.1/96").unwrap();
        let (mut left_conn, _) = left.accept().unwrap();

        // now the far router comes up
        let right = TcpListener::bind("127.0.0.1:10096").unwrap();

        left_conn.write_all(b"frame").unwrap();
        bridge.tick().unwrap();

        let (mut right_conn, _) = right.accept().unwrap();
        right_conn
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut got = [0u8; 5];
        right_conn.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"frame");
    }
}
