use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::Timeouts;
use crate::error::ControlError;
use crate::server::{Handler, ServerHandle};

/// Everything the control loop mutates. Lives behind the controller's single
/// lock; callers stage `address`/`handler` into it before enqueueing.
pub(crate) struct ServerState {
    pub address: String,
    pub handler: Option<Handler>,
    pub timeouts: Timeouts,
    pub active: Option<ServerHandle>,
    /// Set when a listener was lost without a clean shutdown. Cleared by the
    /// next successful bind.
    pub fault: Option<Arc<ControlError>>,
    pub stopped: bool,
}

impl ServerState {
    pub fn new(address: String, timeouts: Timeouts) -> Self {
        Self {
            address,
            handler: None,
            timeouts,
            active: None,
            fault: None,
            stopped: false,
        }
    }

    pub fn status(&self) -> ServerStatus {
        if self.stopped {
            return ServerStatus::Stopped;
        }
        if let Some(active) = &self.active {
            return ServerStatus::Running {
                address: self.address.clone(),
                local_addr: active.local_addr(),
            };
        }
        match &self.fault {
            Some(reason) => ServerStatus::Degraded {
                reason: reason.clone(),
            },
            None => ServerStatus::Idle,
        }
    }
}

/// Externally visible controller state.
#[derive(Debug, Clone)]
pub enum ServerStatus {
    /// No listener bound.
    Idle,
    /// A listener is bound and accepting.
    Running {
        /// Configured address, as staged.
        address: String,
        /// Address the socket is actually bound to.
        local_addr: SocketAddr,
    },
    /// The last listener failed to shut down cleanly and was force-closed.
    /// Nothing is bound; an explicit start or restart binds again.
    Degraded { reason: Arc<ControlError> },
    /// Terminal. The control loop has processed Stop.
    Stopped,
}

impl ServerStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    #[test]
    fn status_follows_fields() {
        let mut state = ServerState::new(":8080".into(), ServerConfig::default().timeouts());
        assert!(matches!(state.status(), ServerStatus::Idle));

        state.fault = Some(Arc::new(ControlError::ShutdownFailed {
            addr: "127.0.0.1:8080".parse().unwrap(),
            reason: "boom".into(),
        }));
        assert!(matches!(state.status(), ServerStatus::Degraded { .. }));

        state.stopped = true;
        assert!(matches!(state.status(), ServerStatus::Stopped));
        assert!(!state.status().is_running());
    }
}
