//! Serving a single accepted connection.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use hyper::Request;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::debug;

use super::Handler;
use crate::config::Timeouts;

/// Serve HTTP/1.1 on `stream` until the peer closes, the connection idles
/// out, or `shutdown` fires. On shutdown the request in flight (if any) is
/// allowed to finish before the connection closes.
pub(super) async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Handler,
    timeouts: Timeouts,
    shutdown: CancellationToken,
) {
    let activity = Arc::new(Activity::new());

    let service = {
        let activity = activity.clone();
        service_fn(move |req: Request<Incoming>| {
            let handler = handler.clone();
            let busy = activity.begin();
            async move {
                let _busy = busy;
                match tokio::time::timeout(timeouts.write, handler.oneshot(req)).await {
                    Ok(Ok(response)) => Ok(response),
                    Ok(Err(infallible)) => match infallible {},
                    Err(_) => Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "response not produced within write timeout",
                    )),
                }
            }
        })
    };

    let mut builder = http1::Builder::new();
    builder
        .timer(TokioTimer::new())
        .header_read_timeout(timeouts.read)
        .keep_alive(true);

    let conn = builder
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();
    tokio::pin!(conn);

    let mut closing = false;
    loop {
        let idle_deadline =
            tokio::time::Instant::from_std(activity.idle_deadline(timeouts.idle));

        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!(peer = %peer, error = %e, "Connection ended with error");
                }
                break;
            }
            _ = shutdown.cancelled(), if !closing => {
                conn.as_mut().graceful_shutdown();
                closing = true;
            }
            _ = tokio::time::sleep_until(idle_deadline), if !closing => {
                if activity.is_idle_for(timeouts.idle) {
                    debug!(peer = %peer, "Closing idle connection");
                    conn.as_mut().graceful_shutdown();
                    closing = true;
                }
            }
        }
    }
}

/// Tracks whether a connection has a request in flight and when it last did.
struct Activity {
    busy: AtomicUsize,
    last_ms: AtomicU64,
    start: Instant,
}

impl Activity {
    fn new() -> Self {
        Self {
            busy: AtomicUsize::new(0),
            last_ms: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    fn begin(self: &Arc<Self>) -> BusyGuard {
        self.busy.fetch_add(1, Ordering::AcqRel);
        BusyGuard(self.clone())
    }

    fn touch(&self) {
        let now_ms = self.start.elapsed().as_millis() as u64;
        self.last_ms.store(now_ms, Ordering::Release);
    }

    fn last_seen(&self) -> Instant {
        self.start + Duration::from_millis(self.last_ms.load(Ordering::Acquire))
    }

    /// When the connection would count as idle, assuming nothing changes.
    fn idle_deadline(&self, idle: Duration) -> Instant {
        if self.busy.load(Ordering::Acquire) > 0 {
            Instant::now() + idle
        } else {
            self.last_seen() + idle
        }
    }

    fn is_idle_for(&self, idle: Duration) -> bool {
        self.busy.load(Ordering::Acquire) == 0 && self.last_seen().elapsed() >= idle
    }
}

struct BusyGuard(Arc<Activity>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.touch();
        self.0.busy.fetch_sub(1, Ordering::AcqRel);
    }
}
