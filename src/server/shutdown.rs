//! Bounded graceful shutdown of a bound listener.

use std::net::SocketAddr;
use std::time::Duration;

use tracing::{error, info, warn};

use super::ServerHandle;
use crate::error::ControlError;

/// Stops a listener: refuse new connections at once, let in-flight requests
/// finish for up to `timeout`, then force-close whatever is left.
///
/// Every outcome is returned as a value. The call never waits longer than the
/// timeout plus the time it takes to abort the accept task.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownCoordinator {
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Shut `server` down, returning the address it was bound to.
    ///
    /// On `Err` the listener is gone as well: a timed-out accept task is
    /// aborted, which drops every connection it still owned.
    pub async fn shutdown(&self, server: ServerHandle) -> Result<SocketAddr, ControlError> {
        let (addr, token, mut task) = server.into_parts();
        info!(addr = %addr, timeout = ?self.timeout, "Shutting down listener");
        token.cancel();

        match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(Ok(())) => {
                info!(addr = %addr, "Listener stopped gracefully");
                Ok(addr)
            }
            Ok(Err(join_err)) => {
                error!(addr = %addr, error = %join_err, "Listener task failed during shutdown");
                Err(ControlError::ShutdownFailed {
                    addr,
                    reason: join_err.to_string(),
                })
            }
            Err(_) => {
                warn!(addr = %addr, timeout = ?self.timeout, "Graceful shutdown timed out, force-closing connections");
                task.abort();
                // Cancellation is the expected outcome; only wait for the
                // connections to be dropped.
                let _ = task.await;
                Err(ControlError::ShutdownTimeout {
                    addr,
                    timeout: self.timeout,
                })
            }
        }
    }
}
