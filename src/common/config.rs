//! Configuration for replistore components

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming an alternative config file
pub const CONFIG_PATH_ENV: &str = "REPLISTORE_CONFIG";

/// Global configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Controller-specific config
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller: Option<ControllerConfig>,

    /// Dstore-specific config
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dstore: Option<DstoreConfig>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load `replistore.toml` (or the file named by `REPLISTORE_CONFIG`),
    /// overlaid with `REPLISTORE_*` environment variables.
    ///
    /// A missing file is not an error; CLI flags are applied on top by the binaries.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "replistore".to_string());
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(config::Environment::with_prefix("REPLISTORE").separator("__"))
            .build()?;
        let mut loaded: Config = settings.try_deserialize()?;
        if loaded.log_level.is_empty() {
            loaded.log_level = default_log_level();
        }
        Ok(loaded)
    }
}

/// Controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Listening port for clients and dstores
    #[serde(default = "default_controller_port")]
    pub port: u16,

    /// Number of dstores that must hold every stored file
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,

    /// Per-operation timeout (acknowledgements, list collection, reload window)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Interval between rebalance cycles
    #[serde(default = "default_rebalance_period_ms")]
    pub rebalance_period_ms: u64,

    /// Queued requests per client session before reads stall
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
}

fn default_controller_port() -> u16 {
    4321
}
fn default_replication_factor() -> usize {
    3
}
fn default_timeout_ms() -> u64 {
    2_000
}
fn default_rebalance_period_ms() -> u64 {
    30_000
}
fn default_inbox_capacity() -> usize {
    64
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            port: default_controller_port(),
            replication_factor: default_replication_factor(),
            timeout_ms: default_timeout_ms(),
            rebalance_period_ms: default_rebalance_period_ms(),
            inbox_capacity: default_inbox_capacity(),
        }
    }
}

impl ControllerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn rebalance_period(&self) -> Duration {
        Duration::from_millis(self.rebalance_period_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.replication_factor == 0 {
            return Err(Error::InvalidConfig(
                "replication factor must be at least 1".into(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(Error::InvalidConfig("timeout must be positive".into()));
        }
        if self.rebalance_period_ms == 0 {
            return Err(Error::InvalidConfig(
                "rebalance period must be positive".into(),
            ));
        }
        if self.inbox_capacity == 0 {
            return Err(Error::InvalidConfig("inbox capacity must be positive".into()));
        }
        Ok(())
    }
}

/// Dstore configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DstoreConfig {
    /// Listening port, also the dstore's identity
    pub port: u16,

    /// Controller port to join
    #[serde(default = "default_controller_port")]
    pub controller_port: u16,

    /// Timeout for peer handshakes and payload transfers
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Directory holding stored files
    pub data_dir: PathBuf,
}

impl DstoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(Error::InvalidConfig("timeout must be positive".into()));
        }
        if self.port == self.controller_port {
            return Err(Error::InvalidConfig(format!(
                "dstore port {} collides with controller port",
                self.port
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_defaults_are_valid() {
        let config = ControllerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timeout(), Duration::from_millis(2_000));
    }

    #[test]
    fn test_zero_replication_rejected() {
        let config = ControllerConfig {
            replication_factor: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_dstore_port_collision_rejected() {
        let config = DstoreConfig {
            port: 4321,
            controller_port: 4321,
            timeout_ms: 1000,
            data_dir: PathBuf::from("/tmp/dstore"),
        };
        assert!(config.validate().is_err());
    }
}
