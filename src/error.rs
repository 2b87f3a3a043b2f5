//! Custom error types for the bridge transport.
//!
//! This module defines the primary error type, `BridgeError`, for the whole crate.
//! Using the `thiserror` crate, it provides a consistent way to report everything
//! from malformed discovery datagrams to control-channel socket failures.
//!
//! ## Error Hierarchy
//!
//! - **`MalformedReply`**: a discovery datagram failed its length or field checks. The
//!   discovery loop drops these and keeps listening.
//! - **`NoDeviceFound`**: discovery finished without a single accepted reply.
//! - **`InvalidTimeout`** / **`TimeoutMismatch`**: a session was requested with a timeout
//!   outside the bridge's accepted range, or with a different timeout than the session
//!   already open for that host.
//! - **`InvalidAddress`**: a GPIB bus address outside `0..=30`.
//! - **`Connection`**: socket connect/send/recv failure. Never retried; the caller decides
//!   whether to re-open the session.
//! - **`Timeout`**: no reply within the read budget. The socket stays usable.
//! - **`Config`** / **`Configuration`**: settings could not be loaded or failed validation.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

/// Errors reported by discovery, sessions and configuration.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// A discovery datagram failed its length, magic or type check.
    #[error("Malformed discovery reply: {0}")]
    MalformedReply(String),

    #[error("No GPIB bridge found on any network interface")]
    /// Discovery finished without an accepted reply.
    NoDeviceFound,

    /// Session timeout outside `1ms..=3s`.
    #[error("Invalid session timeout {0:?}: must be between 1ms and 3s")]
    InvalidTimeout(Duration),

    #[error(
        "Session for '{host}' already open with timeout {existing:?}, requested {requested:?}"
    )]
    /// The host already has a session with another timeout.
    TimeoutMismatch {
        /// Host identifier the session is registered under.
        host: String,
        /// Timeout of the open session.
        existing: Duration,
        /// Timeout the caller asked for.
        requested: Duration,
    },

    /// GPIB address outside `0..=30`.
    #[error("Invalid GPIB address {0}: must be between 0 and 30")]
    InvalidAddress(u8),

    #[error("Connection error on '{host}' while {context}: {source}")]
    /// Socket failure on the control channel.
    Connection {
        /// Bridge host.
        host: String,
        /// What was being done when the socket failed.
        context: &'static str,
        /// Underlying socket error.
        #[source]
        source: io::Error,
    },

    #[error("Timed out waiting for '{host}' after {attempts} read attempt(s)")]
    /// No reply within the read budget.
    Timeout {
        /// Bridge host.
        host: String,
        /// Read attempts made before giving up.
        attempts: u32,
    },

    /// Settings could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Loaded settings failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

impl BridgeError {
    /// Classify an I/O failure on the control channel.
    ///
    /// Socket read timeouts surface as `TimedOut` on Windows and `WouldBlock` on Unix;
    /// both become [`BridgeError::Timeout`]. Everything else is a connection failure.
    pub fn from_io(host: &str, context: &'static str, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => BridgeError::Timeout {
                host: host.to_string(),
                attempts: 1,
            },
            _ => BridgeError::Connection {
                host: host.to_string(),
                context,
                source,
            },
        }
    }

    /// Whether retrying the read may still succeed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, BridgeError::Timeout { .. })
    }
}

impl From<figment::Error> for BridgeError {
    fn from(value: figment::Error) -> Self {
        BridgeError::Config(Box::new(value))
    }
}
