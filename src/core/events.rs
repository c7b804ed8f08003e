//! Lifecycle signals emitted by the control loop.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::broadcast;

use super::command::CommandKind;
use crate::error::ControlError;

const EVENT_CAPACITY: usize = 64;

/// Something the control loop did (or declined to do).
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// A listener was bound by a Start command.
    Started { addr: SocketAddr },
    /// A Restart command bound a new listener. `previous` is the listener it
    /// replaced, if one was running.
    Restarted {
        previous: Option<SocketAddr>,
        addr: SocketAddr,
    },
    /// A listener was shut down cleanly.
    ShutdownComplete { addr: SocketAddr },
    /// The command was a no-op (already running, nothing to stop).
    Skipped {
        command: CommandKind,
        reason: Arc<ControlError>,
    },
    /// The command could not be applied.
    Failed {
        command: CommandKind,
        error: Arc<ControlError>,
    },
    /// The control loop exited; no further commands are accepted.
    Stopped,
}

impl LifecycleEvent {
    /// The listener address bound by this event, if it bound one.
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Started { addr } | Self::Restarted { addr, .. } => Some(*addr),
            _ => None,
        }
    }
}

/// Broadcast channel of [`LifecycleEvent`]s. Publishing never blocks and
/// never fails; events sent with no subscriber are dropped.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: LifecycleEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(LifecycleEvent::Stopped);
    }

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();

        bus.publish(LifecycleEvent::Started { addr });
        bus.publish(LifecycleEvent::ShutdownComplete { addr });

        assert_eq!(rx.recv().await.unwrap().bound_addr(), Some(addr));
        assert!(matches!(
            rx.recv().await.unwrap(),
            LifecycleEvent::ShutdownComplete { .. }
        ));
    }
}
