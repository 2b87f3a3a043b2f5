//! The transport contract instrument drivers program against.
//!
//! Drivers only need three operations: send a command, read a reply, and the
//! two combined. [`InstrumentTransport`] is the blocking form, implemented by
//! [`DeviceHandle`]. Async drivers use [`ScpiTransport`]; [`AsyncTransport`]
//! adapts any blocking transport by running each call on tokio's blocking pool.

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::bridge::DeviceHandle;
use crate::error::BridgeResult;

/// Blocking write/read/query contract.
pub trait InstrumentTransport: Send + Sync {
    /// Send a command that produces no reply.
    fn write(&self, cmd: &str) -> BridgeResult<()>;
    /// Read one reply.
    fn read(&self) -> BridgeResult<String>;
    /// Send a command and read its reply.
    fn query(&self, cmd: &str) -> BridgeResult<String>;
}

impl InstrumentTransport for DeviceHandle {
    fn write(&self, cmd: &str) -> BridgeResult<()> {
        DeviceHandle::write(self, cmd)
    }

    fn read(&self) -> BridgeResult<String> {
        DeviceHandle::read(self)
    }

    fn query(&self, cmd: &str) -> BridgeResult<String> {
        DeviceHandle::query(self, cmd)
    }
}

/// Trait for SCPI communication transports used from async code.
#[async_trait]
pub trait ScpiTransport: Send + Sync {
    /// Send a query command and return the response.
    async fn query(&self, command: &str) -> Result<String>;

    /// Send a command without expecting a response.
    async fn command(&self, command: &str) -> Result<()>;
}

/// Async adapter over a blocking [`InstrumentTransport`].
#[derive(Debug, Clone)]
pub struct AsyncTransport<T> {
    inner: T,
}

impl<T> AsyncTransport<T>
where
    T: InstrumentTransport + Clone + 'static,
{
    /// Wrap a blocking transport.
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    /// The wrapped transport.
    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Read without sending a command first.
    pub async fn read(&self) -> Result<String> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.read())
            .await
            .context("Transport task panicked")?
            .context("Instrument read failed")
    }
}

#[async_trait]
impl<T> ScpiTransport for AsyncTransport<T>
where
    T: InstrumentTransport + Clone + 'static,
{
    async fn query(&self, command: &str) -> Result<String> {
        let inner = self.inner.clone();
        let owned = command.to_string();
        tokio::task::spawn_blocking(move || inner.query(&owned))
            .await
            .context("Transport task panicked")?
            .with_context(|| format!("SCPI query '{command}' failed"))
    }

    async fn command(&self, command: &str) -> Result<()> {
        let inner = self.inner.clone();
        let owned = command.to_string();
        tokio::task::spawn_blocking(move || inner.write(&owned))
            .await
            .context("Transport task panicked")?
            .with_context(|| format!("SCPI command '{command}' failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use std::sync::{Arc, Mutex};

    /// Records traffic and answers queries from a fixed reply.
    #[derive(Clone, Default)]
    struct Recorder {
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl InstrumentTransport for Recorder {
        fn write(&self, cmd: &str) -> BridgeResult<()> {
            self.log.lock().unwrap().push(format!("write {cmd}"));
            Ok(())
        }

        fn read(&self) -> BridgeResult<String> {
            self.log.lock().unwrap().push("read".to_string());
            Ok("1.000E+00\n".to_string())
        }

        fn query(&self, cmd: &str) -> BridgeResult<String> {
            self.log.lock().unwrap().push(format!("query {cmd}"));
            if self.fail {
                return Err(BridgeError::Timeout {
                    host: "sim".to_string(),
                    attempts: 10,
                });
            }
            Ok("HEWLETT-PACKARD,34401A,0,11-5-2\n".to_string())
        }
    }

    #[tokio::test]
    async fn async_adapter_forwards_calls() {
        let recorder = Recorder::default();
        let transport = AsyncTransport::new(recorder.clone());

        transport.command("*RST").await.unwrap();
        let idn = transport.query("*IDN?").await.unwrap();
        let value = transport.read().await.unwrap();

        assert!(idn.starts_with("HEWLETT-PACKARD"));
        assert_eq!(value.trim(), "1.000E+00");
        assert_eq!(
            *recorder.log.lock().unwrap(),
            ["write *RST", "query *IDN?", "read"]
        );
    }

    #[tokio::test]
    async fn async_adapter_keeps_bridge_error_as_source() {
        let transport = AsyncTransport::new(Recorder {
            fail: true,
            ..Recorder::default()
        });

        let err = transport.query("MEAS:VOLT:DC?").await.unwrap_err();
        assert!(err.to_string().contains("MEAS:VOLT:DC?"));
        let bridge_err = err.downcast_ref::<BridgeError>().unwrap();
        assert!(bridge_err.is_timeout());
    }
}
