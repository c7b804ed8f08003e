use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Errors produced by lifecycle transitions and the public controller API.
#[derive(Error, Debug, Clone)]
pub enum ControlError {
    /// Start or restart was attempted before any handler was staged.
    #[error("no handler configured, cannot bind a listener")]
    NotConfigured,

    /// Start was requested while a listener is already bound.
    #[error("server already running on {addr}")]
    AlreadyRunning { addr: SocketAddr },

    /// Stop was requested with no active listener.
    #[error("no active server to stop")]
    NotRunning,

    /// In-flight connections did not drain within the shutdown window.
    /// The remaining connections were force-closed.
    #[error("graceful shutdown of {addr} exceeded {timeout:?}, connections force-closed")]
    ShutdownTimeout { addr: SocketAddr, timeout: Duration },

    /// The listener task failed while being shut down.
    #[error("shutdown of {addr} failed: {reason}")]
    ShutdownFailed { addr: SocketAddr, reason: String },

    /// The listener socket could not be bound.
    #[error("failed to bind listener on {address}")]
    BindFailed {
        address: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// The controller has stopped and accepts no further commands.
    #[error("controller is stopped")]
    Closed,
}

impl ControlError {
    /// No-op conditions are absorbed by the control loop: the state machine
    /// stays consistent and they are only reported as signals.
    pub fn is_noop(&self) -> bool {
        matches!(self, Self::AlreadyRunning { .. } | Self::NotRunning)
    }

    pub(crate) fn bind(address: &str, source: std::io::Error) -> Self {
        Self::BindFailed {
            address: address.to_string(),
            source: Arc::new(source),
        }
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration file {} not found", .0.display())]
    Missing(std::path::PathBuf),

    #[error("failed to load configuration")]
    Load(#[from] Box<figment::Error>),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Load(Box::new(err))
    }
}
