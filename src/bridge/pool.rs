//! Shared pool of bridge control connections.
//!
//! Keeps a single [`BridgeSession`] per host identifier and hands it to every
//! device that lives behind that bridge. The pool is an ordinary value: create
//! one, pass it to whoever builds [`DeviceHandle`]s, and drop or
//! [`close_all`](BridgePool::close_all) it when done.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::bridge::device::DeviceHandle;
use crate::bridge::session::{validate_timeout, BridgeHost, BridgeSession, CONTROL_PORT};
use crate::config::SessionSettings;
use crate::error::{BridgeError, BridgeResult};

pub(crate) type Registry = Mutex<HashMap<String, Arc<BridgeSession>>>;

/// Per-host locks serializing connects to the same bridge.
type ConnectGates = Mutex<HashMap<String, Arc<Mutex<()>>>>;

/// Pool of shared bridge sessions keyed by host identifier.
#[derive(Debug)]
pub struct BridgePool {
    control_port: u16,
    settings: SessionSettings,
    sessions: Arc<Registry>,
    gates: ConnectGates,
}

impl Default for BridgePool {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgePool {
    /// Create an empty pool connecting to the standard control port.
    pub fn new() -> Self {
        Self::with_port(CONTROL_PORT)
    }

    /// Create an empty pool connecting to `control_port`.
    pub fn with_port(control_port: u16) -> Self {
        Self::from_settings(&SessionSettings {
            control_port,
            ..SessionSettings::default()
        })
    }

    /// Create an empty pool whose devices use the configured buffers and retry limit.
    pub fn from_settings(settings: &SessionSettings) -> Self {
        Self {
            control_port: settings.control_port,
            settings: settings.clone(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// TCP port new sessions connect to.
    pub fn control_port(&self) -> u16 {
        self.control_port
    }

    /// Settings handed to devices opened through this pool.
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Get the session for `host`, or connect and set one up.
    ///
    /// Connects to the same host are serialized by a per-host lock, so concurrent
    /// opens never produce two sockets while a slow host does not hold up opens
    /// of other hosts. Reopening with a different timeout fails with
    /// [`BridgeError::TimeoutMismatch`] instead of silently keeping the old one.
    pub fn open(&self, host: &str, timeout: Duration) -> BridgeResult<Arc<BridgeSession>> {
        validate_timeout(timeout)?;

        if let Some(existing) = self.existing(host, timeout)? {
            return Ok(existing);
        }

        let gate = self.gates.lock().entry(host.to_string()).or_default().clone();
        let _connecting = gate.lock();

        // Another caller may have finished connecting while we waited.
        if let Some(existing) = self.existing(host, timeout)? {
            return Ok(existing);
        }

        let session = Arc::new(BridgeSession::connect(
            host,
            self.control_port,
            timeout,
            Arc::downgrade(&self.sessions),
        )?);
        self.sessions
            .lock()
            .insert(host.to_string(), session.clone());
        Ok(session)
    }

    /// [`open`](BridgePool::open) with the configured session timeout.
    pub fn open_configured(&self, host: &str) -> BridgeResult<Arc<BridgeSession>> {
        self.open(host, self.settings.timeout())
    }

    fn existing(&self, host: &str, timeout: Duration) -> BridgeResult<Option<Arc<BridgeSession>>> {
        let sessions = self.sessions.lock();
        let Some(existing) = sessions.get(host) else {
            return Ok(None);
        };
        if existing.timeout() != timeout {
            return Err(BridgeError::TimeoutMismatch {
                host: host.to_string(),
                existing: existing.timeout(),
                requested: timeout,
            });
        }
        debug!(host, "Reusing bridge session");
        Ok(Some(existing.clone()))
    }

    /// [`open`](BridgePool::open) for a [`BridgeHost`].
    pub fn open_host(&self, host: &BridgeHost) -> BridgeResult<Arc<BridgeSession>> {
        self.open(&host.host, host.timeout)
    }

    /// Open (or reuse) the session for `host` and bind a device handle to `address`.
    pub fn open_device(
        &self,
        host: &str,
        timeout: Duration,
        address: u8,
    ) -> BridgeResult<DeviceHandle> {
        let session = self.open(host, timeout)?;
        Ok(DeviceHandle::new(session, address)?.with_settings(&self.settings))
    }

    /// [`open_device`](BridgePool::open_device) with the configured session timeout.
    pub fn open_device_configured(&self, host: &str, address: u8) -> BridgeResult<DeviceHandle> {
        self.open_device(host, self.settings.timeout(), address)
    }

    /// Open session for `host`, if any.
    pub fn get(&self, host: &str) -> Option<Arc<BridgeSession>> {
        self.sessions.lock().get(host).cloned()
    }

    /// Whether `host` has an open session.
    pub fn contains(&self, host: &str) -> bool {
        self.sessions.lock().contains_key(host)
    }

    /// Host identifiers with an open session.
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.sessions.lock().keys().cloned().collect();
        hosts.sort();
        hosts
    }

    /// Number of open sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether no session is open.
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Close the session for `host`. Returns `false` if none was open.
    pub fn close(&self, host: &str) -> bool {
        let removed = self.sessions.lock().remove(host);
        match removed {
            Some(session) => {
                session.shutdown();
                true
            }
            None => false,
        }
    }

    /// Close every session in the pool.
    pub fn close_all(&self) {
        let drained: Vec<Arc<BridgeSession>> =
            self.sessions.lock().drain().map(|(_, session)| session).collect();
        if !drained.is_empty() {
            info!(count = drained.len(), "Closing all bridge sessions");
        }
        for session in drained {
            session.shutdown();
        }
    }
}
