//! Lifecycle control: the public [`Controller`], the command queue and the
//! control loop that applies commands to the single managed listener.
//!
//! ## Architecture
//!
//! - `controller`: public API; stages configuration and enqueues commands
//! - `control_loop`: the only consumer of the queue; runs every transition
//! - `state`: the lock-protected server record and its public status view
//! - `events`: broadcast bus of lifecycle signals

mod command;
mod control_loop;
mod controller;
mod events;
mod state;

pub use command::CommandKind;
pub use controller::Controller;
pub use events::{EventBus, LifecycleEvent};
pub use state::ServerStatus;
