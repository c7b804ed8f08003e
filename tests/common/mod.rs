#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{Router, routing::get};
use graceful::{Controller, LifecycleEvent, ServerConfig};
use tokio::sync::{Notify, broadcast};
use tokio::time::timeout;

pub const EVENT_WAIT: Duration = Duration::from_secs(10);

/// Router answering `GET /` with `body`.
pub fn hello(body: &'static str) -> Router {
    Router::new().route("/", get(move || async move { body }))
}

/// Router whose `GET /slow` signals `entered` and then sleeps `delay`
/// before answering "done".
pub fn slow(entered: Arc<Notify>, delay: Duration) -> Router {
    Router::new().route(
        "/slow",
        get(move || {
            let entered = entered.clone();
            async move {
                entered.notify_one();
                tokio::time::sleep(delay).await;
                "done"
            }
        }),
    )
}

/// Controller on an ephemeral loopback port with `tweak` applied to the
/// default config.
pub fn controller_with(tweak: impl FnOnce(&mut ServerConfig)) -> Controller {
    let mut config = ServerConfig::with_address("127.0.0.1:0");
    tweak(&mut config);
    Controller::with_config(config).expect("valid config")
}

pub fn controller_with_shutdown(shutdown: Duration) -> Controller {
    controller_with(|config| config.shutdown_timeout_ms = shutdown.as_millis() as u64)
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("client")
}

pub async fn get_text(addr: SocketAddr, path: &str) -> reqwest::Result<String> {
    client()
        .get(format!("http://{addr}{path}"))
        .send()
        .await?
        .error_for_status()?
        .text()
        .await
}

pub async fn next_event(rx: &mut broadcast::Receiver<LifecycleEvent>) -> LifecycleEvent {
    timeout(EVENT_WAIT, rx.recv())
        .await
        .expect("timeout waiting for lifecycle event")
        .expect("event channel closed")
}

/// Skip events until one binds a listener; return its address.
pub async fn next_bound(rx: &mut broadcast::Receiver<LifecycleEvent>) -> SocketAddr {
    loop {
        let event = next_event(rx).await;
        if let Some(addr) = event.bound_addr() {
            return addr;
        }
        if let LifecycleEvent::Failed { error, .. } = &event {
            panic!("expected a bind, got failure: {error}");
        }
    }
}

pub async fn refuses_connections(addr: SocketAddr) -> bool {
    tokio::net::TcpStream::connect(addr).await.is_err()
}
