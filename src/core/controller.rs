use std::sync::Arc;

use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio_util::task::TaskTracker;
use tracing::Instrument;
use uuid::Uuid;

use super::command::Command;
use super::control_loop::ControlLoop;
use super::events::{EventBus, LifecycleEvent};
use super::state::{ServerState, ServerStatus};
use crate::config::ServerConfig;
use crate::error::{ConfigError, ControlError};
use crate::server::Handler;

/// Caller-facing handle for one managed listener.
///
/// Methods only stage configuration and enqueue commands; the control loop
/// spawned by [`Controller::new`] applies them in order. Clones share the same
/// loop, so any number of tasks may drive one listener concurrently.
///
/// Must be created inside a Tokio runtime.
#[derive(Clone)]
pub struct Controller {
    id: Uuid,
    state: Arc<Mutex<ServerState>>,
    commands: mpsc::Sender<Command>,
    events: EventBus,
    tracker: TaskTracker,
}

impl Controller {
    /// Controller for `address` with default timeouts. Nothing is bound
    /// until [`Controller::start`].
    pub fn new(address: impl Into<String>) -> Self {
        Self::spawn(ServerConfig::with_address(address))
    }

    /// Controller with explicit timeouts and queue capacity.
    pub fn with_config(config: ServerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::spawn(config))
    }

    fn spawn(config: ServerConfig) -> Self {
        let id = Uuid::now_v7();
        let state = Arc::new(Mutex::new(ServerState::new(
            config.address.clone(),
            config.timeouts(),
        )));
        let (commands, rx) = mpsc::channel(config.queue_capacity.max(1));
        let events = EventBus::new();
        let tracker = TaskTracker::new();

        let control = ControlLoop::new(state.clone(), events.clone(), tracker.clone());
        tracker.spawn(
            control
                .run(rx)
                .instrument(tracing::info_span!("controller", id = %id)),
        );
        // Closing only lets `wait` complete once the tracker is empty; the
        // loop can still spawn listener tasks onto it.
        tracker.close();

        Self {
            id,
            state,
            commands,
            events,
            tracker,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Stage `handler` and ask the loop to bind a listener.
    ///
    /// Returns once the command is queued, not once the listener is bound;
    /// watch [`Controller::subscribe`] for the outcome. Starting a running
    /// server is a reported no-op.
    pub async fn start(&self, handler: Handler) -> Result<(), ControlError> {
        // The slot is reserved before the lock: the loop needs the lock to
        // free a slot, so waiting for one while holding it would deadlock.
        let permit = self.reserve().await?;

        let mut state = self.state.lock().await;
        if state.stopped {
            return Err(ControlError::Closed);
        }
        state.handler = Some(handler);
        // Sent under the lock so staging order matches queue order.
        permit.send(Command::Start);
        Ok(())
    }

    /// Stage overrides and ask the loop to replace the listener.
    ///
    /// `None` (or an empty address) keeps the current value. The running
    /// listener, if any, is shut down gracefully before the new one binds.
    pub async fn restart(
        &self,
        address: Option<String>,
        handler: Option<Handler>,
    ) -> Result<(), ControlError> {
        let address = address.filter(|a| !a.trim().is_empty());
        let permit = self.reserve().await?;

        let mut state = self.state.lock().await;
        if state.stopped {
            return Err(ControlError::Closed);
        }
        if let Some(address) = &address {
            state.address = address.clone();
        }
        if let Some(handler) = &handler {
            state.handler = Some(handler.clone());
        }
        permit.send(Command::Restart { address, handler });
        Ok(())
    }

    async fn reserve(&self) -> Result<mpsc::Permit<'_, Command>, ControlError> {
        self.commands
            .reserve()
            .await
            .map_err(|_| ControlError::Closed)
    }

    /// Stop the listener and the control loop, waiting for both.
    ///
    /// Returns the outcome of the final shutdown. The controller is stopped
    /// either way; calling this again afterwards returns `Ok(())`.
    pub async fn stop(&self) -> Result<(), ControlError> {
        let (reply, outcome) = oneshot::channel();

        let result = match self.commands.send(Command::Stop { reply }).await {
            Ok(()) => outcome.await.unwrap_or(Ok(())),
            Err(_) => Ok(()),
        };

        self.tracker.wait().await;
        result
    }

    /// Current state. Waits for a transition in progress to finish.
    pub async fn status(&self) -> ServerStatus {
        self.state.lock().await.status()
    }

    /// Receive every lifecycle event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, routing::get};
    use std::time::Duration;
    use tokio::time::timeout;

    fn router() -> Router {
        Router::new().route("/", get(|| async { "ok" }))
    }

    async fn next_event(rx: &mut broadcast::Receiver<LifecycleEvent>) -> LifecycleEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timeout waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn new_controller_is_idle() {
        let controller = Controller::new("127.0.0.1:0");
        assert!(matches!(controller.status().await, ServerStatus::Idle));
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn with_config_rejects_invalid_config() {
        let mut config = ServerConfig::with_address("127.0.0.1:0");
        config.queue_capacity = 0;
        assert!(Controller::with_config(config).is_err());
    }

    #[tokio::test]
    async fn restart_without_handler_is_not_configured() {
        let controller = Controller::new("127.0.0.1:0");
        let mut events = controller.subscribe();

        controller.restart(None, None).await.unwrap();
        match next_event(&mut events).await {
            LifecycleEvent::Failed { error, .. } => {
                assert!(matches!(*error, ControlError::NotConfigured));
            }
            other => panic!("expected NotConfigured failure, got {other:?}"),
        }
        assert!(matches!(controller.status().await, ServerStatus::Idle));
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_start_is_skipped() {
        let controller = Controller::new("127.0.0.1:0");
        let mut events = controller.subscribe();

        controller.start(router()).await.unwrap();
        controller.start(router()).await.unwrap();

        let first = next_event(&mut events).await;
        let addr = first.bound_addr().expect("first start binds");
        match next_event(&mut events).await {
            LifecycleEvent::Skipped { reason, .. } => {
                assert!(matches!(*reason, ControlError::AlreadyRunning { addr: a } if a == addr));
            }
            other => panic!("expected skipped start, got {other:?}"),
        }

        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_without_listener_is_a_noop() {
        let controller = Controller::new("127.0.0.1:0");
        let mut events = controller.subscribe();

        controller.stop().await.unwrap();
        assert!(matches!(
            next_event(&mut events).await,
            LifecycleEvent::Skipped { .. }
        ));
        assert!(matches!(next_event(&mut events).await, LifecycleEvent::Stopped));
        assert!(matches!(controller.status().await, ServerStatus::Stopped));
    }

    #[tokio::test]
    async fn commands_after_stop_are_rejected() {
        let controller = Controller::new("127.0.0.1:0");
        controller.stop().await.unwrap();

        assert!(matches!(
            controller.start(router()).await,
            Err(ControlError::Closed)
        ));
        assert!(matches!(
            controller.restart(Some("127.0.0.1:0".into()), None).await,
            Err(ControlError::Closed)
        ));
        assert!(controller.stop().await.is_ok());
    }

    #[tokio::test]
    async fn empty_restart_address_keeps_current() {
        let controller = Controller::new("127.0.0.1:0");
        let mut events = controller.subscribe();
        controller.start(router()).await.unwrap();
        controller.restart(Some(String::new()), None).await.unwrap();

        assert!(matches!(next_event(&mut events).await, LifecycleEvent::Started { .. }));
        assert!(matches!(
            next_event(&mut events).await,
            LifecycleEvent::ShutdownComplete { .. }
        ));
        assert!(matches!(
            next_event(&mut events).await,
            LifecycleEvent::Restarted { previous: Some(_), .. }
        ));

        match controller.status().await {
            ServerStatus::Running { address, .. } => assert_eq!(address, "127.0.0.1:0"),
            other => panic!("expected running, got {other:?}"),
        }
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn dropping_every_handle_stops_the_listener() {
        let controller = Controller::new("127.0.0.1:0");
        let mut events = controller.subscribe();
        controller.start(router()).await.unwrap();
        let addr = next_event(&mut events).await.bound_addr().unwrap();

        drop(controller);

        assert!(matches!(
            next_event(&mut events).await,
            LifecycleEvent::ShutdownComplete { addr: a } if a == addr
        ));
        assert!(matches!(next_event(&mut events).await, LifecycleEvent::Stopped));
    }
}
