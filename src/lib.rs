//! Graceful lifecycle control for a single HTTP listener.
//!
//! A [`Controller`] owns one listener and serializes `start`, `restart` and
//! `stop` requests through a command queue, so concurrent callers never race
//! each other and a replacement listener is only bound after the previous one
//! has drained (or been force-closed after a bounded timeout).
//!
//! ```ignore
//! let controller = graceful::Controller::new(":8080");
//! controller.start(router).await?;
//! controller.restart(Some(":8081".into()), None).await?;
//! controller.stop().await?;
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod server;

pub use config::{ServerConfig, Timeouts};
pub use self::core::{CommandKind, Controller, LifecycleEvent, ServerStatus};
pub use error::{ConfigError, ControlError};
pub use server::Handler;
