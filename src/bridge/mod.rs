//! Control-channel sessions and per-device handles.
//!
//! - **`session`**: one TCP connection to a bridge, its setup sequence and line I/O.
//! - **`pool`**: one session per host, shared by every device behind it.
//! - **`device`**: an address-bound handle with the write/read/query contract.
//!
//! ```no_run
//! use std::time::Duration;
//! use gpib_bridge::bridge::BridgePool;
//!
//! # fn main() -> Result<(), gpib_bridge::BridgeError> {
//! let pool = BridgePool::new();
//! let dmm = pool.open_device("192.168.1.50", Duration::from_secs(1), 22)?;
//! let counter = pool.open_device("192.168.1.50", Duration::from_secs(1), 3)?;
//! println!("{}", dmm.idn()?);
//! println!("{}", counter.query("READ?")?);
//! # Ok(())
//! # }
//! ```

pub mod device;
pub mod pool;
pub mod session;

pub use device::DeviceHandle;
pub use pool::BridgePool;
pub use session::{BridgeHost, BridgeSession, SessionGuard, CONTROL_PORT, MAX_ADDRESS};
