//! # GPIB Bridge Transport
//!
//! Transport layer for laboratory instruments reached through GPIB-to-Ethernet
//! bridges. Instrument drivers sit on top of the write/read/query contract this
//! crate exposes and never deal with sockets directly.
//!
//! ## Crate Structure
//!
//! - **`discovery`**: finds bridges on every local network via the NetFinder UDP
//!   broadcast protocol. See `discovery::Discovery`.
//! - **`bridge`**: the control channel. `BridgePool` keeps one `BridgeSession` per
//!   bridge host; `DeviceHandle` binds a session to one bus address and reselects it
//!   before every operation.
//! - **`transport`**: the `InstrumentTransport` trait drivers consume, plus an async
//!   adapter for tokio-based drivers.
//! - **`config`**: figment-based settings loaded from TOML and the environment.
//! - **`logging`**: tracing subscriber setup.
//! - **`error`**: the `BridgeError` enum shared by all modules.
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use gpib_bridge::{BridgePool, Discovery};
//!
//! # fn main() -> Result<(), gpib_bridge::BridgeError> {
//! let ip = Discovery::default().discover_first(Duration::from_millis(500))?;
//! let pool = BridgePool::new();
//! let dmm = pool.open_device(&ip.to_string(), Duration::from_secs(1), 22)?;
//! dmm.reset()?;
//! println!("{}", dmm.idn()?);
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod config;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod transport;

pub use bridge::{BridgeHost, BridgePool, BridgeSession, DeviceHandle};
pub use config::BridgeSettings;
pub use discovery::{Discovery, DiscoveryReply};
pub use error::{BridgeError, BridgeResult};
pub use transport::{AsyncTransport, InstrumentTransport, ScpiTransport};
