//! melodyd - music playback control daemon
//!
//! Binds the configured listener, builds the session manager and the
//! built-in command dispatcher, and runs the accept loop plus the expiry
//! sweep until a shutdown signal or a `kill` command arrives.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use melodyd::command::{CommandDispatcher, CommandExecutor};
use melodyd::config::{Config, ConfigError};
use melodyd::listener::{Listener, ListenerError};
use melodyd::server::{self, ClientManager};

/// melodyd - music playback control daemon
#[derive(Parser, Debug)]
#[command(name = "melodyd", version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured bind address (host:port or a Unix socket path)
    #[arg(long)]
    bind: Option<String>,
}

#[derive(Error, Debug)]
enum DaemonError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("listener error: {0}")]
    Listener(#[from] ListenerError),
}

#[tokio::main]
async fn main() -> Result<(), DaemonError> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "melodyd=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("melodyd starting");

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    config.validate()?;

    let limits = config.limits();
    let default_permission = config.default_permission_mask()?;

    let listener = Listener::bind(&config.bind_address).await?;
    tracing::info!(addr = %config.bind_address, "melodyd listening");

    let manager = ClientManager::new(limits, default_permission);
    let executor: Arc<dyn CommandExecutor> = Arc::new(CommandDispatcher::new());

    let sweeper = tokio::spawn(server::sweep(manager.clone()));
    let acceptor = tokio::spawn(server::serve(manager.clone(), listener, executor));

    let shutdown_token = manager.shutdown_token();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C");
        }
        _ = shutdown_token.cancelled() => {
            tracing::info!("shutdown requested");
        }
    }

    manager.shutdown();
    match acceptor.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "accept loop failed"),
        Err(e) => tracing::warn!(?e, "accept loop task panicked"),
    }
    if let Err(e) = sweeper.await {
        tracing::warn!(?e, "sweep task panicked");
    }

    tracing::info!("melodyd exiting");
    Ok(())
}
