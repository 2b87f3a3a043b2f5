//! Configuration loading using Figment.
//!
//! Settings are layered from:
//! 1. Built-in defaults (every field has one)
//! 2. A TOML file (`config/gpib_bridge.toml` unless another path is given)
//! 3. Environment variables prefixed with `GPIB_BRIDGE_`, nesting separated by `__`
//!
//! # Example
//! ```no_run
//! use gpib_bridge::config::BridgeSettings;
//!
//! // GPIB_BRIDGE_BRIDGE__TIMEOUT_MS=2500 overrides [bridge] timeout_ms
//! let settings = BridgeSettings::load()?;
//! settings.validate()?;
//! println!("control port: {}", settings.bridge.control_port);
//! # Ok::<(), gpib_bridge::BridgeError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use crate::bridge::device::{DEFAULT_QUERY_BYTES, DEFAULT_READ_BYTES, DEFAULT_RETRY_LIMIT};
use crate::bridge::session::{validate_timeout, CONTROL_PORT};
use crate::discovery::protocol::NETFINDER_PORT;
use crate::error::{BridgeError, BridgeResult};
use crate::logging::OutputFormat;

/// Default location of the settings file.
pub const DEFAULT_CONFIG_PATH: &str = "config/gpib_bridge.toml";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "GPIB_BRIDGE_";

/// Top-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BridgeSettings {
    /// Log filter and output format
    pub logging: LoggingSettings,
    /// Discovery broadcast settings
    pub discovery: DiscoverySettings,
    /// Control-channel session settings
    pub bridge: SessionSettings,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Logging level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format
    pub format: OutputFormat,
}

/// Discovery configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    /// How long each interface listens for replies
    pub timeout_ms: u64,
    /// Receive timeout between deadline checks
    pub poll_interval_ms: u64,
    /// UDP port bridges listen on
    pub server_port: u16,
    /// Request destination address
    pub target: Ipv4Addr,
}

/// Control-channel configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// TCP port of the bridge control channel
    pub control_port: u16,
    /// Session timeout for configured opens (1..=3000 ms), sent as `++read_tmo_ms`
    pub timeout_ms: u64,
    /// Read attempts per query before reporting a timeout
    pub query_retry_limit: u32,
    /// Receive buffer for plain reads
    pub read_buffer_bytes: usize,
    /// Receive buffer for query replies
    pub query_buffer_bytes: usize,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: OutputFormat::Pretty,
        }
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            timeout_ms: 500,
            poll_interval_ms: 100,
            server_port: NETFINDER_PORT,
            target: Ipv4Addr::BROADCAST,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            control_port: CONTROL_PORT,
            timeout_ms: 1000,
            query_retry_limit: DEFAULT_RETRY_LIMIT,
            read_buffer_bytes: DEFAULT_READ_BYTES,
            query_buffer_bytes: DEFAULT_QUERY_BYTES,
        }
    }
}

impl DiscoverySettings {
    /// Listening window per discovery run.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Receive timeout between deadline checks.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl SessionSettings {
    /// Session timeout used by [`BridgePool::open_configured`](crate::bridge::BridgePool::open_configured).
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl BridgeSettings {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> BridgeResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment. A missing file is not an error.
    pub fn load_from<P: AsRef<Path>>(path: P) -> BridgeResult<Self> {
        let settings = Figment::from(Serialized::defaults(BridgeSettings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> BridgeResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(BridgeError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        validate_timeout(self.bridge.timeout())?;

        if self.bridge.query_retry_limit == 0 {
            return Err(BridgeError::Configuration(
                "query_retry_limit must be at least 1".to_string(),
            ));
        }

        if self.bridge.read_buffer_bytes == 0 || self.bridge.query_buffer_bytes == 0 {
            return Err(BridgeError::Configuration(
                "read buffers must be non-empty".to_string(),
            ));
        }

        if self.discovery.poll_interval_ms == 0 {
            return Err(BridgeError::Configuration(
                "discovery poll_interval_ms must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let settings = BridgeSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.bridge.control_port, 1234);
        assert_eq!(settings.discovery.server_port, 3040);
        assert_eq!(settings.bridge.timeout(), Duration::from_secs(1));
    }

    #[test]
    #[serial]
    fn loads_partial_file_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[bridge]
timeout_ms = 2500
query_retry_limit = 3

[discovery]
target = "192.168.1.255"
"#
        )
        .unwrap();

        let settings = BridgeSettings::load_from(file.path()).unwrap();
        assert_eq!(settings.bridge.timeout_ms, 2500);
        assert_eq!(settings.bridge.query_retry_limit, 3);
        assert_eq!(settings.bridge.control_port, 1234);
        assert_eq!(settings.discovery.target, Ipv4Addr::new(192, 168, 1, 255));
        assert!(settings.validate().is_ok());
    }

    #[test]
    #[serial]
    fn environment_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "bridge.toml",
                r#"
[bridge]
timeout_ms = 200
"#,
            )?;
            jail.set_env("GPIB_BRIDGE_BRIDGE__TIMEOUT_MS", "750");
            jail.set_env("GPIB_BRIDGE_LOGGING__FORMAT", "json");

            let settings = BridgeSettings::load_from("bridge.toml").map_err(|e| e.to_string())?;
            assert_eq!(settings.bridge.timeout_ms, 750);
            assert_eq!(settings.logging.format, OutputFormat::Json);
            Ok(())
        });
    }

    #[test]
    #[serial]
    fn missing_file_uses_defaults() {
        let settings = BridgeSettings::load_from("does/not/exist.toml").unwrap();
        assert_eq!(settings.bridge, SessionSettings::default());
    }

    #[test]
    fn rejects_out_of_range_timeout() {
        let mut settings = BridgeSettings::default();
        settings.bridge.timeout_ms = 5000;
        assert!(matches!(
            settings.validate(),
            Err(BridgeError::InvalidTimeout(_))
        ));

        settings.bridge.timeout_ms = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_invalid_log_level() {
        let mut settings = BridgeSettings::default();
        settings.logging.level = "verbose".to_string();
        assert!(matches!(
            settings.validate(),
            Err(BridgeError::Configuration(_))
        ));
    }

    #[test]
    fn rejects_zero_retry_limit() {
        let mut settings = BridgeSettings::default();
        settings.bridge.query_retry_limit = 0;
        assert!(settings.validate().is_err());
    }
}
