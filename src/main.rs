use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use clap::{Args, Parser, Subcommand};
use graceful::logging::{self, LogConfig};
use graceful::{ControlError, Controller, LifecycleEvent, ServerConfig, Timeouts};
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(name = "graceful")]
#[command(about = "HTTP server with graceful start, restart and stop", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the demo router until interrupted. SIGHUP reloads the config
    /// file and restarts on the configured address; timeout changes need a
    /// process restart.
    Serve(ServeArgs),
    /// Print the effective configuration as TOML
    Config(ServeArgs),
}

#[derive(Args, Serialize)]
struct ServeArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    address: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    shutdown_timeout_ms: Option<u64>,

    #[serde(skip)]
    #[arg(long)]
    json: bool,

    #[serde(skip)]
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve(args) => {
            logging::init(LogConfig {
                json: args.json,
                verbose: args.verbose,
            });
            let config = load_config(cli.config.as_deref(), args)?;
            run_server(config, cli.config.as_deref(), args)
                .await
                .context("Server exited with an error")?
        }
        Commands::Config(args) => {
            let config = load_config(cli.config.as_deref(), args)?;
            let rendered =
                toml::to_string_pretty(&config).context("Failed to serialize config")?;
            print!("{rendered}");
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>, args: &ServeArgs) -> Result<ServerConfig> {
    ServerConfig::load_with(path, Some(args)).context("Failed to load configuration")
}

fn demo_router() -> Router {
    Router::new()
        .route("/", get(|| async { "Hello, World!" }))
        .route("/healthz", get(|| async { "ok" }))
}

async fn run_server(config: ServerConfig, path: Option<&Path>, args: &ServeArgs) -> Result<()> {
    let timeouts = config.timeouts();
    let controller = Controller::with_config(config).context("Invalid configuration")?;
    let mut events = controller.subscribe();
    tracing::info!(id = %controller.id(), "Controller created");

    controller.start(demo_router()).await?;

    let mut reload = reload_signal()?;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Some(()) = reload.recv() => {
                match load_config(path, args) {
                    Ok(config) => {
                        if timeouts_changed(&timeouts, &config) {
                            tracing::warn!(
                                "Timeouts changed in the config file; only the address is reloaded, restart the process to apply them"
                            );
                        }
                        controller.restart(Some(config.address), None).await?
                    }
                    Err(e) => tracing::error!(error = %e, "Reload failed, keeping current listener"),
                }
            }
            event = events.recv() => match event {
                Ok(LifecycleEvent::Failed { error, .. })
                    if matches!(*error, ControlError::BindFailed { .. }) =>
                {
                    return Err(stop_after_bind_failure(&controller, &error).await);
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    controller.stop().await.context("Shutdown did not complete cleanly")
}

/// SIGHUP only moves the listener; the controller keeps the timeouts it was
/// created with.
fn timeouts_changed(current: &Timeouts, reloaded: &ServerConfig) -> bool {
    reloaded.timeouts() != *current
}

async fn stop_after_bind_failure(controller: &Controller, error: &ControlError) -> anyhow::Error {
    if let Err(e) = controller.stop().await {
        tracing::warn!(error = %e, "Shutdown after bind failure was not clean");
    }
    anyhow::Error::new(error.clone())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received CTRL+C, stopping"),
        _ = terminate => tracing::info!("Received SIGTERM, stopping"),
    }
}

/// Yields once per SIGHUP. On platforms without SIGHUP the channel is
/// closed immediately.
fn reload_signal() -> Result<tokio::sync::mpsc::Receiver<()>> {
    let (tx, rx) = tokio::sync::mpsc::channel(1);

    #[cfg(unix)]
    {
        let mut hangup =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
                .context("Failed to listen for SIGHUP")?;
        tokio::spawn(async move {
            while hangup.recv().await.is_some() {
                tracing::info!("Received SIGHUP, reloading");
                if tx.send(()).await.is_err() {
                    break;
                }
            }
        });
    }

    #[cfg(not(unix))]
    drop(tx);

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_only_reload_keeps_timeouts() {
        let current = ServerConfig::default().timeouts();

        let moved = ServerConfig::with_address("127.0.0.1:9090");
        assert!(!timeouts_changed(&current, &moved));

        let mut slower = ServerConfig::default();
        slower.shutdown_timeout_ms = 30_000;
        assert!(timeouts_changed(&current, &slower));
    }

    #[tokio::test]
    async fn bind_failure_stops_the_controller_and_keeps_the_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let busy = taken.local_addr().unwrap().to_string();

        let controller = Controller::new(busy.clone());
        let mut events = controller.subscribe();
        controller.start(demo_router()).await.unwrap();

        let error = loop {
            match events.recv().await.unwrap() {
                LifecycleEvent::Failed { error, .. } => break error,
                _ => continue,
            }
        };

        let err = stop_after_bind_failure(&controller, &error).await;
        match err.downcast_ref::<ControlError>() {
            Some(ControlError::BindFailed { address, .. }) => assert_eq!(*address, busy),
            other => panic!("expected BindFailed, got {other:?}"),
        }
        assert!(matches!(
            controller.status().await,
            graceful::ServerStatus::Stopped
        ));
    }
}
