//! Broadcast discovery of bridges on every local IPv4 interface.
//!
//! Each interface gets its own send/receive socket pair and runs on a scoped
//! thread. Accepted replies flow through one channel into a single aggregator
//! that deduplicates by hardware address.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, instrument, trace, warn, Span};

use crate::config::DiscoverySettings;
use crate::discovery::protocol::{
    decode_reply, encode_request, DiscoveryReply, MacAddress, NETFINDER_PORT,
};
use crate::error::{BridgeError, BridgeResult};

/// Upper bound on a listening window, applied when the requested one overflows
/// the clock.
pub const MAX_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Socket-level knobs for a discovery run.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// UDP port bridges listen on.
    pub server_port: u16,
    /// Destination of the identify request. The limited broadcast address by default.
    pub target: Ipv4Addr,
    /// Receive timeout between deadline checks.
    pub poll_interval: Duration,
    /// Listening window used by [`Discovery::discover_configured`].
    pub timeout: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self::from(&DiscoverySettings::default())
    }
}

impl From<&DiscoverySettings> for DiscoveryOptions {
    fn from(settings: &DiscoverySettings) -> Self {
        Self {
            server_port: settings.server_port,
            target: settings.target,
            poll_interval: settings.poll_interval(),
            timeout: settings.timeout(),
        }
    }
}

/// NetFinder discovery client.
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    options: DiscoveryOptions,
}

impl Discovery {
    /// Create a discovery client with explicit options.
    pub fn new(options: DiscoveryOptions) -> Self {
        Self { options }
    }

    /// Create a discovery client from the `[discovery]` settings section.
    pub fn from_settings(settings: &DiscoverySettings) -> Self {
        Self::new(DiscoveryOptions::from(settings))
    }

    /// Options this client runs with.
    pub fn options(&self) -> &DiscoveryOptions {
        &self.options
    }

    /// [`Discovery::discover`] with the configured listening window.
    pub fn discover_configured(&self) -> Vec<DiscoveryReply> {
        self.discover(self.options.timeout)
    }

    /// [`Discovery::discover_first`] with the configured listening window.
    pub fn discover_first_configured(&self) -> BridgeResult<Ipv4Addr> {
        self.discover_first(self.options.timeout)
    }

    /// Discover bridges reachable from any local interface.
    ///
    /// Returns one reply per hardware address, in the order each address was first
    /// seen. Interfaces that cannot be used are logged and skipped.
    pub fn discover(&self, timeout: Duration) -> Vec<DiscoveryReply> {
        let interfaces = local_ipv4_interfaces();
        self.discover_on(&interfaces, timeout)
    }

    /// Run discovery on an explicit set of interface addresses.
    #[instrument(skip(self, interfaces), fields(interfaces = interfaces.len()))]
    pub fn discover_on(&self, interfaces: &[Ipv4Addr], timeout: Duration) -> Vec<DiscoveryReply> {
        let (tx, rx) = mpsc::channel::<DiscoveryReply>();
        let span = Span::current();

        thread::scope(|scope| {
            for &iface in interfaces {
                let tx = tx.clone();
                let options = &self.options;
                let span = span.clone();
                scope.spawn(move || {
                    let _entered = span.enter();
                    if let Err(e) = probe_interface(iface, options, timeout, &tx) {
                        warn!(%iface, error = %e, "Skipping interface for discovery");
                    }
                });
            }
            // Aggregator stops once every probe has dropped its sender.
            drop(tx);
            let found = aggregate(rx);
            info!(count = found.len(), "Discovery finished");
            found
        })
    }

    /// IP address of the first bridge that answered.
    pub fn discover_first(&self, timeout: Duration) -> BridgeResult<Ipv4Addr> {
        first_address(self.discover(timeout))
    }

    /// Run [`Discovery::discover`] on the blocking pool of the current tokio runtime.
    pub async fn discover_async(&self, timeout: Duration) -> anyhow::Result<Vec<DiscoveryReply>> {
        let discovery = self.clone();
        tokio::task::spawn_blocking(move || discovery.discover(timeout))
            .await
            .map_err(|e| anyhow::anyhow!("Discovery task panicked: {e}"))
    }
}

/// Discover bridges with default options.
pub fn discover(timeout: Duration) -> Vec<DiscoveryReply> {
    Discovery::default().discover(timeout)
}

/// IP address of the first bridge found with default options.
pub fn discover_first(timeout: Duration) -> BridgeResult<Ipv4Addr> {
    Discovery::default().discover_first(timeout)
}

/// Instant `timeout` from now, capped at [`MAX_WINDOW`] if that overflows.
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + MAX_WINDOW)
}

pub(crate) fn first_address(found: Vec<DiscoveryReply>) -> BridgeResult<Ipv4Addr> {
    found
        .first()
        .map(|reply| reply.ip_addr)
        .ok_or(BridgeError::NoDeviceFound)
}

/// Deduplicate by hardware address: last reply wins, first-seen order kept.
fn aggregate(rx: mpsc::Receiver<DiscoveryReply>) -> Vec<DiscoveryReply> {
    let mut found: Vec<DiscoveryReply> = Vec::new();
    let mut index: HashMap<MacAddress, usize> = HashMap::new();
    for reply in rx {
        match index.get(&reply.hw_addr) {
            Some(&slot) => found[slot] = reply,
            None => {
                index.insert(reply.hw_addr, found.len());
                found.push(reply);
            }
        }
    }
    found
}

/// All IPv4 addresses assigned to local interfaces.
pub fn local_ipv4_interfaces() -> Vec<Ipv4Addr> {
    let interfaces = match local_ip_address::list_afinet_netifas() {
        Ok(ifs) => ifs,
        Err(e) => {
            warn!(error = %e, "Failed to list network interfaces");
            return vec![];
        }
    };

    let addrs: Vec<Ipv4Addr> = interfaces
        .into_iter()
        .filter_map(|(name, ip)| match ip {
            IpAddr::V4(v4) => {
                trace!(interface = %name, addr = %v4, "Found IPv4 interface");
                Some(v4)
            }
            IpAddr::V6(_) => None,
        })
        .collect();

    debug!(count = addrs.len(), "Enumerated IPv4 interfaces");
    addrs
}

fn probe_interface(
    iface: Ipv4Addr,
    options: &DiscoveryOptions,
    timeout: Duration,
    tx: &mpsc::Sender<DiscoveryReply>,
) -> io::Result<()> {
    let sender = reusable_udp_socket()?;
    sender.set_broadcast(true)?;
    sender.bind(&SocketAddrV4::new(iface, 0).into())?;
    let local_port = sender
        .local_addr()?
        .as_socket()
        .map(|addr| addr.port())
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "send socket has no inet address"))?;

    let receiver = reusable_udp_socket()?;
    receiver.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, local_port).into())?;
    let receiver: UdpSocket = receiver.into();

    let sequence = rand::thread_rng().gen_range(1..=u16::MAX);
    let target = SocketAddr::V4(SocketAddrV4::new(options.target, options.server_port));
    let request = encode_request(sequence);
    let sender: UdpSocket = sender.into();
    sender.send_to(&request, target)?;
    // Free the port so unicast replies land on the receive socket.
    drop(sender);
    debug!(%iface, local_port, sequence, %target, "Sent identify request");

    let deadline = deadline_after(timeout);
    let mut buf = [0u8; 256];
    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let wait = options
            .poll_interval
            .min(deadline - now)
            .max(Duration::from_millis(1));
        receiver.set_read_timeout(Some(wait))?;

        match receiver.recv_from(&mut buf) {
            Ok((len, from)) => {
                let reply = match decode_reply(&buf[..len]) {
                    Ok(reply) => reply,
                    Err(e) => {
                        debug!(%iface, %from, error = %e, "Dropping datagram");
                        continue;
                    }
                };
                if reply.sequence != sequence {
                    debug!(
                        %iface, %from,
                        expected = sequence,
                        got = reply.sequence,
                        "Dropping reply with foreign sequence number"
                    );
                    continue;
                }
                info!(
                    %iface,
                    hw_addr = %reply.hw_addr,
                    ip = %reply.ip_addr,
                    name = %reply.name,
                    "Bridge answered"
                );
                if tx.send(reply).is_err() {
                    break;
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn reusable_udp_socket() -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    Ok(socket)
}
