//! The bound HTTP listener.
//!
//! A listener is a TCP socket plus the background task that accepts on it and
//! serves every connection with the caller's router. The control loop owns the
//! resulting [`ServerHandle`] and is the only thing that ever shuts it down.
//!
//! ## Architecture
//!
//! - `connection`: per-connection hyper serving with read/write/idle timeouts
//! - `shutdown`: bounded graceful shutdown of a [`ServerHandle`]

mod connection;
mod shutdown;

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::config::Timeouts;
use crate::error::ControlError;
use crate::logging::LogThrottle;

pub use shutdown::ShutdownCoordinator;

/// The request-handling capability served by a listener. The controller
/// never looks inside it.
pub type Handler = Router;

/// Pause after an accept error that is not tied to a single connection.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Ownership handle to a bound listener and its accept task.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub(crate) fn from_parts(
        local_addr: SocketAddr,
        shutdown: CancellationToken,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            local_addr,
            shutdown,
            task,
        }
    }

    /// The address the socket is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// True once the accept task has exited. Outside of a shutdown this only
    /// happens if the task panicked.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub(crate) fn into_parts(self) -> (SocketAddr, CancellationToken, JoinHandle<()>) {
        (self.local_addr, self.shutdown, self.task)
    }
}

/// Turn `:port` into `0.0.0.0:port`; anything else is passed to the resolver
/// untouched.
pub fn bind_target(address: &str) -> String {
    let address = address.trim();
    if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    }
}

/// Bind `address` and spawn the accept loop on `tracker`.
///
/// Binding is done here rather than inside the spawned task so a bind failure
/// is reported to the caller before anything is considered running.
pub async fn bind(
    address: &str,
    handler: Handler,
    timeouts: Timeouts,
    tracker: &TaskTracker,
) -> Result<ServerHandle, ControlError> {
    let listener = TcpListener::bind(bind_target(address))
        .await
        .map_err(|e| ControlError::bind(address, e))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| ControlError::bind(address, e))?;

    let shutdown = CancellationToken::new();
    let task = tracker.spawn(accept_loop(
        listener,
        local_addr,
        handler,
        timeouts,
        shutdown.clone(),
    ));

    info!(addr = %local_addr, "Listener bound");
    Ok(ServerHandle::from_parts(local_addr, shutdown, task))
}

async fn accept_loop(
    listener: TcpListener,
    local_addr: SocketAddr,
    handler: Handler,
    timeouts: Timeouts,
    shutdown: CancellationToken,
) {
    let mut connections = JoinSet::new();
    let throttle = LogThrottle::new(Duration::from_secs(5));

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            Some(_) = connections.join_next(), if !connections.is_empty() => {}

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(addr = %local_addr, peer = %peer, "Connection accepted");
                    connections.spawn(connection::serve(
                        stream,
                        peer,
                        handler.clone(),
                        timeouts,
                        shutdown.child_token(),
                    ));
                }
                Err(e) if is_connection_error(&e) => {
                    debug!(addr = %local_addr, error = %e, "Connection failed during accept");
                }
                Err(e) => {
                    if let Some(suppressed) = throttle.permit() {
                        error!(addr = %local_addr, error = %e, suppressed, "Failed to accept connection");
                    }
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }

    // Refuse new connections while the open ones drain.
    drop(listener);
    info!(
        addr = %local_addr,
        open = connections.len(),
        "Listener closed, draining connections"
    );

    while connections.join_next().await.is_some() {}
    debug!(addr = %local_addr, "All connections drained");
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}
