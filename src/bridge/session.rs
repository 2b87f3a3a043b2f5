//! Control-channel session to one bridge.
//!
//! A session owns the single TCP connection to a bridge host. Every logical
//! instrument behind that bridge shares it, so the bus address has to be
//! selected before each transaction. [`BridgeSession::lock`] hands out a
//! [`SessionGuard`] that keeps `++addr` and the operation depending on it
//! together when handles are driven from several threads.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::bridge::pool::Registry;
use crate::error::{BridgeError, BridgeResult};

/// TCP port of the bridge control channel.
pub const CONTROL_PORT: u16 = 1234;

/// Shortest timeout the bridge accepts for `++read_tmo_ms`.
pub const MIN_TIMEOUT: Duration = Duration::from_millis(1);

/// Longest timeout the bridge accepts for `++read_tmo_ms`.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(3);

/// Highest GPIB primary address.
pub const MAX_ADDRESS: u8 = 30;

/// Check `timeout` against the range the bridge accepts.
pub fn validate_timeout(timeout: Duration) -> BridgeResult<()> {
    if timeout < MIN_TIMEOUT || timeout > MAX_TIMEOUT {
        return Err(BridgeError::InvalidTimeout(timeout));
    }
    Ok(())
}

/// Check `address` is a valid GPIB primary address.
pub fn validate_address(address: u8) -> BridgeResult<()> {
    if address > MAX_ADDRESS {
        return Err(BridgeError::InvalidAddress(address));
    }
    Ok(())
}

/// A physical bridge: where to connect and with which timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeHost {
    /// Hostname or IP address.
    pub host: String,
    /// Socket and `++read_tmo_ms` timeout.
    pub timeout: Duration,
}

impl BridgeHost {
    /// Validate `timeout` and build the host description.
    pub fn new(host: impl Into<String>, timeout: Duration) -> BridgeResult<Self> {
        validate_timeout(timeout)?;
        Ok(Self {
            host: host.into(),
            timeout,
        })
    }
}

struct SessionIo {
    stream: TcpStream,
    last_selected: Option<u8>,
}

/// One open control connection, shared by every device on the bridge.
pub struct BridgeSession {
    host: String,
    timeout: Duration,
    io: Mutex<SessionIo>,
    /// Second handle on the socket so `close` can unblock a pending read.
    shutdown_handle: TcpStream,
    closed: AtomicBool,
    registry: Weak<Registry>,
}

impl std::fmt::Debug for BridgeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeSession")
            .field("host", &self.host)
            .field("timeout", &self.timeout)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl BridgeSession {
    /// Connect to `host:port` and run the device setup sequence.
    ///
    /// Any failure, including during setup, aborts the open: a session either
    /// initializes fully or does not exist.
    #[instrument(skip(registry), err)]
    pub(crate) fn connect(
        host: &str,
        port: u16,
        timeout: Duration,
        registry: Weak<Registry>,
    ) -> BridgeResult<Self> {
        validate_timeout(timeout)?;

        let stream = connect_stream(host, port, timeout)?;
        let configure = |stream: &TcpStream| -> io::Result<TcpStream> {
            stream.set_read_timeout(Some(timeout))?;
            stream.set_write_timeout(Some(timeout))?;
            stream.set_nodelay(true)?;
            stream.try_clone()
        };
        let shutdown_handle = configure(&stream)
            .map_err(|e| BridgeError::from_io(host, "configuring socket", e))?;

        let session = Self {
            host: host.to_string(),
            timeout,
            io: Mutex::new(SessionIo {
                stream,
                last_selected: None,
            }),
            shutdown_handle,
            closed: AtomicBool::new(false),
            registry,
        };
        session.lock().setup()?;

        info!(host, ?timeout, "Bridge session ready");
        Ok(session)
    }

    /// Host identifier this session was opened with.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Socket and device-side read timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether [`close`](BridgeSession::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Address sent with the most recent `++addr`, if any.
    pub fn last_selected(&self) -> Option<u8> {
        self.io.lock().last_selected
    }

    /// Exclusive access to the connection.
    ///
    /// Hold the guard across `select` and the operation that depends on it.
    pub fn lock(&self) -> SessionGuard<'_> {
        SessionGuard {
            session: self,
            io: self.io.lock(),
        }
    }

    /// Lock and [`SessionGuard::select`].
    pub fn select(&self, address: u8) -> BridgeResult<()> {
        self.lock().select(address)
    }

    /// Lock and [`SessionGuard::write`].
    pub fn write(&self, cmd: &str) -> BridgeResult<()> {
        self.lock().write(cmd)
    }

    /// Lock and [`SessionGuard::read`].
    pub fn read(&self, max_bytes: usize) -> BridgeResult<String> {
        self.lock().read(max_bytes)
    }

    /// Lock and [`SessionGuard::query`]. No retry.
    pub fn query(&self, cmd: &str, max_bytes: usize) -> BridgeResult<String> {
        self.lock().query(cmd, max_bytes)
    }

    /// Resend the setup sequence on the live connection.
    ///
    /// Use after power-cycling the bridge or when replies stop lining up with
    /// requests; it does not reconnect.
    pub fn reinitialize(&self) -> BridgeResult<()> {
        let mut guard = self.lock();
        guard.io.last_selected = None;
        guard.setup()
    }

    /// Close the socket and drop this session from its pool.
    pub fn close(&self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut sessions = registry.lock();
            let is_registered = sessions
                .get(&self.host)
                .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(entry), self));
            if is_registered {
                sessions.remove(&self.host);
            }
        }
        self.shutdown();
    }

    /// Shut the socket down without touching the registry.
    pub(crate) fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.shutdown_handle.shutdown(Shutdown::Both) {
            // Already disconnected by the peer.
            debug!(host = %self.host, error = %e, "Socket shutdown failed");
        }
        info!(host = %self.host, "Bridge session closed");
    }
}

/// Locked view of a session. See [`BridgeSession::lock`].
pub struct SessionGuard<'a> {
    session: &'a BridgeSession,
    io: MutexGuard<'a, SessionIo>,
}

impl SessionGuard<'_> {
    /// Route subsequent bus traffic to `address`.
    pub fn select(&mut self, address: u8) -> BridgeResult<()> {
        validate_address(address)?;
        self.send_line(&format!("++addr {address}"))?;
        self.io.last_selected = Some(address);
        Ok(())
    }

    /// Send one bus command.
    pub fn write(&mut self, cmd: &str) -> BridgeResult<()> {
        self.send_line(cmd)
    }

    /// Ask the selected device to talk, then receive up to `max_bytes`.
    ///
    /// A socket timeout is reported as [`BridgeError::Timeout`] and not retried here.
    pub fn read(&mut self, max_bytes: usize) -> BridgeResult<String> {
        self.send_line("++read eoi")?;

        let host = &self.session.host;
        let mut buf = vec![0u8; max_bytes.max(1)];
        let n = self
            .io
            .stream
            .read(&mut buf)
            .map_err(|e| BridgeError::from_io(host, "reading reply", e))?;
        if n == 0 {
            return Err(BridgeError::Connection {
                host: host.clone(),
                context: "reading reply",
                source: io::Error::new(io::ErrorKind::UnexpectedEof, "bridge closed the connection"),
            });
        }

        let reply = String::from_utf8_lossy(&buf[..n]).into_owned();
        debug!(host = %host, reply = %reply.escape_default(), "<-");
        Ok(reply)
    }

    /// Write `cmd`, then a single [`read`](SessionGuard::read).
    pub fn query(&mut self, cmd: &str, max_bytes: usize) -> BridgeResult<String> {
        self.write(cmd)?;
        self.read(max_bytes)
    }

    /// Address sent with the most recent `++addr`, if any.
    pub fn last_selected(&self) -> Option<u8> {
        self.io.last_selected
    }

    fn setup(&mut self) -> BridgeResult<()> {
        let read_tmo_ms = self.session.timeout.as_millis();
        // Controller mode
        self.send_line("++mode 1")?;
        // No automatic read-after-write
        self.send_line("++auto 0")?;
        self.send_line(&format!("++read_tmo_ms {read_tmo_ms}"))?;
        // No CR/LF appended to bus data
        self.send_line("++eos 3")
    }

    fn send_line(&mut self, line: &str) -> BridgeResult<()> {
        let host = &self.session.host;
        if self.session.is_closed() {
            return Err(BridgeError::Connection {
                host: host.clone(),
                context: "sending command",
                source: io::Error::new(io::ErrorKind::NotConnected, "session is closed"),
            });
        }

        debug!(host = %host, line, "->");
        let mut framed = String::with_capacity(line.len() + 1);
        framed.push_str(line);
        framed.push('\n');
        self.io
            .stream
            .write_all(framed.as_bytes())
            .map_err(|source| BridgeError::Connection {
                host: host.clone(),
                context: "sending command",
                source,
            })
    }
}

fn connect_stream(host: &str, port: u16, timeout: Duration) -> BridgeResult<TcpStream> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|source| BridgeError::Connection {
            host: host.to_string(),
            context: "resolving host",
            source,
        })?
        .collect();

    let mut last_err =
        io::Error::new(io::ErrorKind::AddrNotAvailable, "host resolved to no addresses");
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                debug!(host, %addr, "Connected to bridge");
                return Ok(stream);
            }
            Err(e) => {
                warn!(host, %addr, error = %e, "Bridge connect attempt failed");
                last_err = e;
            }
        }
    }

    Err(BridgeError::Connection {
        host: host.to_string(),
        context: "connecting",
        source: last_err,
    })
}
