//! The single consumer of lifecycle commands.
//!
//! Commands are applied one at a time, in queue order, each with the state
//! lock held for the whole transition. That serialization is what keeps two
//! transitions from ever touching the listener at the same time.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::command::{Command, CommandKind};
use super::events::{EventBus, LifecycleEvent};
use super::state::ServerState;
use crate::error::ControlError;
use crate::server::{self, ShutdownCoordinator};

pub(crate) struct ControlLoop {
    state: Arc<Mutex<ServerState>>,
    events: EventBus,
    tracker: TaskTracker,
}

impl ControlLoop {
    pub(crate) fn new(
        state: Arc<Mutex<ServerState>>,
        events: EventBus,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            state,
            events,
            tracker,
        }
    }

    pub(crate) async fn run(self, mut commands: mpsc::Receiver<Command>) {
        debug!("Control loop started");

        loop {
            let Some(command) = commands.recv().await else {
                info!("Every controller handle was dropped, stopping");
                let result = self.stop().await;
                self.report(CommandKind::Stop, result);
                break;
            };

            let kind = command.kind();
            match command {
                Command::Start => {
                    let result = self.start().await;
                    self.report(kind, result);
                }
                Command::Restart { address, handler } => {
                    debug!(
                        address = ?address,
                        handler_replaced = handler.is_some(),
                        "Restart requested"
                    );
                    let result = self.restart().await;
                    self.report(kind, result);
                }
                Command::Stop { reply } => {
                    let result = self.stop().await;
                    let outcome = match &result {
                        Err(e) if !e.is_noop() => Err(e.clone()),
                        _ => Ok(()),
                    };
                    self.report(kind, result);
                    close_queue(&mut commands);
                    let _ = reply.send(outcome);
                    break;
                }
            }
        }

        self.events.publish(LifecycleEvent::Stopped);
        info!("Control loop exited");
    }

    async fn start(&self) -> Result<LifecycleEvent, ControlError> {
        let mut state = self.state.lock().await;
        self.reap(&mut state, CommandKind::Start).await;

        if let Some(active) = &state.active {
            return Err(ControlError::AlreadyRunning {
                addr: active.local_addr(),
            });
        }
        let handler = state.handler.clone().ok_or(ControlError::NotConfigured)?;

        let bound = server::bind(&state.address, handler, state.timeouts, &self.tracker).await;
        let server = record_bind(&mut state, bound)?;
        let addr = server.local_addr();
        state.active = Some(server);

        info!(addr = %addr, "Server started");
        Ok(LifecycleEvent::Started { addr })
    }

    async fn restart(&self) -> Result<LifecycleEvent, ControlError> {
        let mut state = self.state.lock().await;
        self.reap(&mut state, CommandKind::Restart).await;

        let handler = state.handler.clone().ok_or(ControlError::NotConfigured)?;

        let previous = match state.active.take() {
            Some(active) => {
                let coordinator = ShutdownCoordinator::new(state.timeouts.shutdown);
                match coordinator.shutdown(active).await {
                    Ok(addr) => {
                        info!(addr = %addr, "Server stopped, restarting");
                        self.events.publish(LifecycleEvent::ShutdownComplete { addr });
                        Some(addr)
                    }
                    Err(e) => {
                        state.fault = Some(Arc::new(e.clone()));
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        let bound = server::bind(&state.address, handler, state.timeouts, &self.tracker).await;
        let server = record_bind(&mut state, bound)?;
        let addr = server.local_addr();
        state.active = Some(server);

        info!(addr = %addr, previous = ?previous, "Server restarted");
        Ok(LifecycleEvent::Restarted { previous, addr })
    }

    async fn stop(&self) -> Result<LifecycleEvent, ControlError> {
        let mut state = self.state.lock().await;
        self.reap(&mut state, CommandKind::Stop).await;
        state.stopped = true;

        let active = state.active.take().ok_or(ControlError::NotRunning)?;
        let coordinator = ShutdownCoordinator::new(state.timeouts.shutdown);
        let addr = coordinator.shutdown(active).await.inspect_err(|e| {
            state.fault = Some(Arc::new(e.clone()));
        })?;

        info!(addr = %addr, "Server stopped gracefully");
        Ok(LifecycleEvent::ShutdownComplete { addr })
    }

    /// Clear out a listener whose accept task already exited. The accept loop
    /// only returns after a shutdown, so this is a panic.
    async fn reap(&self, state: &mut ServerState, kind: CommandKind) {
        if !state.active.as_ref().is_some_and(|s| s.is_finished()) {
            return;
        }
        let Some(dead) = state.active.take() else {
            return;
        };

        let (addr, _, task) = dead.into_parts();
        let reason = match task.await {
            Err(e) => e.to_string(),
            Ok(()) => "listener exited unexpectedly".to_string(),
        };
        error!(addr = %addr, reason = %reason, "Listener died while running");

        let err = Arc::new(ControlError::ShutdownFailed { addr, reason });
        state.fault = Some(err.clone());
        self.events.publish(LifecycleEvent::Failed {
            command: kind,
            error: err,
        });
    }

    fn report(&self, command: CommandKind, result: Result<LifecycleEvent, ControlError>) {
        let event = match result {
            Ok(event) => event,
            Err(e) if e.is_noop() => {
                warn!(command = %command, reason = %e, "Command had no effect");
                LifecycleEvent::Skipped {
                    command,
                    reason: Arc::new(e),
                }
            }
            Err(e) => {
                error!(command = %command, error = %e, "Command failed");
                LifecycleEvent::Failed {
                    command,
                    error: Arc::new(e),
                }
            }
        };
        self.events.publish(event);
    }
}

/// Refuse further sends and settle whatever was queued behind Stop.
fn close_queue(commands: &mut mpsc::Receiver<Command>) {
    commands.close();
    while let Ok(command) = commands.try_recv() {
        match command {
            Command::Stop { reply } => {
                let _ = reply.send(Ok(()));
            }
            other => {
                warn!(command = %other.kind(), "Discarding command queued after stop");
            }
        }
    }
}

/// Record a bind attempt on `state`: success clears any fault, failure
/// becomes the fault.
fn record_bind(
    state: &mut ServerState,
    bound: Result<server::ServerHandle, ControlError>,
) -> Result<server::ServerHandle, ControlError> {
    match bound {
        Ok(server) => {
            state.fault = None;
            Ok(server)
        }
        Err(e) => {
            state.fault = Some(Arc::new(e.clone()));
            Err(e)
        }
    }
}
