//! Address-scoped handle used by instrument drivers.
//!
//! A [`DeviceHandle`] pairs a shared [`BridgeSession`] with one GPIB address.
//! Every operation reselects the address under the session lock, because other
//! handles may have pointed the bridge elsewhere in the meantime.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::bridge::session::{validate_address, BridgeSession};
use crate::config::SessionSettings;
use crate::error::{BridgeError, BridgeResult};

/// Receive buffer for [`DeviceHandle::read`].
pub const DEFAULT_READ_BYTES: usize = 1024;

/// Receive buffer for query replies.
pub const DEFAULT_QUERY_BYTES: usize = 1024 * 1024;

/// Read attempts per query.
pub const DEFAULT_RETRY_LIMIT: u32 = 10;

/// One instrument behind a bridge.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    session: Arc<BridgeSession>,
    address: u8,
    read_bytes: usize,
    query_bytes: usize,
    retry_limit: u32,
}

impl DeviceHandle {
    /// Bind `session` to `address`. No I/O happens until the first operation.
    pub fn new(session: Arc<BridgeSession>, address: u8) -> BridgeResult<Self> {
        validate_address(address)?;
        Ok(Self {
            session,
            address,
            read_bytes: DEFAULT_READ_BYTES,
            query_bytes: DEFAULT_QUERY_BYTES,
            retry_limit: DEFAULT_RETRY_LIMIT,
        })
    }

    /// Take buffer sizes and the query retry limit from configuration.
    pub fn with_settings(mut self, settings: &SessionSettings) -> Self {
        self.read_bytes = settings.read_buffer_bytes;
        self.query_bytes = settings.query_buffer_bytes;
        self.retry_limit = settings.query_retry_limit;
        self
    }

    /// Override the read attempts per query.
    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    /// GPIB address this handle selects.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// The shared session.
    pub fn session(&self) -> &Arc<BridgeSession> {
        &self.session
    }

    /// Read attempts per [`query`](DeviceHandle::query).
    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    /// Select the address and send `cmd`.
    pub fn write(&self, cmd: &str) -> BridgeResult<()> {
        debug!(address = self.address, cmd, "Write");
        let mut io = self.session.lock();
        io.select(self.address)?;
        io.write(cmd)
    }

    /// Select the address and read one reply, without retry.
    pub fn read(&self) -> BridgeResult<String> {
        let mut io = self.session.lock();
        io.select(self.address)?;
        let reply = io.read(self.read_bytes)?;
        debug!(address = self.address, reply = %reply.trim_end(), "Read");
        Ok(reply)
    }

    /// Write `cmd` and read the reply with the handle's retry limit.
    pub fn query(&self, cmd: &str) -> BridgeResult<String> {
        self.query_with_retry(cmd, self.retry_limit)
    }

    /// Write `cmd` once, then read up to `retry_limit` times.
    ///
    /// Slow instruments may not have an answer ready when the bridge's own read
    /// timeout elapses. Timeouts on all but the last attempt are swallowed; any
    /// other error is returned immediately. A limit of zero behaves like one.
    pub fn query_with_retry(&self, cmd: &str, retry_limit: u32) -> BridgeResult<String> {
        let attempts = retry_limit.max(1);
        debug!(address = self.address, cmd, attempts, "Query");

        let mut io = self.session.lock();
        io.select(self.address)?;
        io.write(cmd)?;

        for attempt in 1..=attempts {
            match io.read(self.query_bytes) {
                Ok(reply) => {
                    debug!(address = self.address, attempt, reply = %reply.trim_end(), "Query reply");
                    return Ok(reply);
                }
                Err(e) if e.is_timeout() && attempt < attempts => {
                    debug!(address = self.address, attempt, "Read timed out, retrying");
                }
                Err(e) if e.is_timeout() => {
                    warn!(address = self.address, cmd, attempts, "Query gave up");
                    return Err(BridgeError::Timeout {
                        host: self.session.host().to_string(),
                        attempts,
                    });
                }
                Err(e) => return Err(e),
            }
        }

        // `attempts >= 1`, so the loop always returns.
        Err(BridgeError::Timeout {
            host: self.session.host().to_string(),
            attempts,
        })
    }

    /// `*IDN?`
    pub fn idn(&self) -> BridgeResult<String> {
        self.query("*IDN?")
    }

    /// `*RST`
    pub fn reset(&self) -> BridgeResult<()> {
        self.write("*RST")
    }

    /// `*CLS`
    pub fn clear(&self) -> BridgeResult<()> {
        self.write("*CLS")
    }

    /// Close the shared session. Every handle on the same bridge loses its connection.
    pub fn close(&self) {
        self.session.close();
    }
}
