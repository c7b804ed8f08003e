use std::fmt;

use tokio::sync::oneshot;

use crate::error::ControlError;
use crate::server::Handler;

/// A lifecycle request queued for the control loop.
pub(crate) enum Command {
    Start,
    /// Overrides were already staged under the lock; they ride along so the
    /// loop can log what the caller asked for.
    Restart {
        address: Option<String>,
        handler: Option<Handler>,
    },
    Stop {
        reply: oneshot::Sender<Result<(), ControlError>>,
    },
}

impl Command {
    pub(crate) fn kind(&self) -> CommandKind {
        match self {
            Self::Start => CommandKind::Start,
            Self::Restart { .. } => CommandKind::Restart,
            Self::Stop { .. } => CommandKind::Stop,
        }
    }
}

/// Which command an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Start,
    Restart,
    Stop,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Start => "start",
            Self::Restart => "restart",
            Self::Stop => "stop",
        })
    }
}
