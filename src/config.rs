use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment variable prefix, e.g. `GRACEFUL_ADDRESS=:9090`.
pub const ENV_PREFIX: &str = "GRACEFUL_";

/// Controller configuration: where to listen and how long to wait.
///
/// Values are layered: built-in defaults, an optional TOML file, `GRACEFUL_*`
/// environment variables, then caller overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// `host:port`, or `:port` for all interfaces.
    pub address: String,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    /// Bound on a graceful shutdown before connections are force-closed.
    pub shutdown_timeout_ms: u64,
    /// Capacity of the lifecycle command queue.
    pub queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: ":8080".to_string(),
            read_timeout_ms: 15_000,
            write_timeout_ms: 15_000,
            idle_timeout_ms: 30_000,
            shutdown_timeout_ms: 5_000,
            queue_capacity: 1,
        }
    }
}

/// Timeouts applied to each bound listener and its shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub read: Duration,
    pub write: Duration,
    pub idle: Duration,
    pub shutdown: Duration,
}

impl ServerConfig {
    /// Config with default timeouts listening on `address`.
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    /// Load configuration from defaults, an optional TOML file and the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, None::<&()>)
    }

    /// Like [`ServerConfig::load`], with `overrides` merged last. Fields the
    /// overrides skip during serialization keep their layered value.
    pub fn load_with<T: Serialize>(
        path: Option<&Path>,
        overrides: Option<&T>,
    ) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(ServerConfig::default()));

        if let Some(path) = path {
            if !path.is_file() {
                return Err(ConfigError::Missing(path.to_path_buf()));
            }
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: ServerConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::Invalid("address must not be empty".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue_capacity must be at least 1".into(),
            ));
        }
        for (name, value) in [
            ("read_timeout_ms", self.read_timeout_ms),
            ("write_timeout_ms", self.write_timeout_ms),
            ("idle_timeout_ms", self.idle_timeout_ms),
            ("shutdown_timeout_ms", self.shutdown_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            read: Duration::from_millis(self.read_timeout_ms),
            write: Duration::from_millis(self.write_timeout_ms),
            idle: Duration::from_millis(self.idle_timeout_ms),
            shutdown: Duration::from_millis(self.shutdown_timeout_ms),
        }
    }
}
