mod admission;
mod cli;
mod config;
mod connection;
mod engine;
mod error;
mod executor;
mod handlers;
mod middleware;
mod protocol;
mod session;
mod websocket;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cli::{Cli, Commands};
use crate::config::Config;
use crate::engine::{ExecutionEngine, HttpEngine};
use crate::handlers::{build_router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env();
    cli.apply(&mut config);

    // Default to the configured level when RUST_LOG is not set.
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", &config.log_level);
    }
    tracing_subscriber::fmt::init();

    if let Some(Commands::Client { url, command }) = cli.command {
        return cli::run_client(url, command).await;
    }

    let engine: Arc<dyn ExecutionEngine> = Arc::new(HttpEngine::new());
    let state = AppState::new(config.clone(), engine);
    let app = build_router(state.clone());

    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("mirage listening on {addr}");
    info!(
        "admission limit: {} concurrent requests",
        config.max_concurrent_requests
    );

    tokio::spawn(watch_shutdown_signals(state.shutdown.clone()));

    axum::serve(listener, app)
        .with_graceful_shutdown(state.shutdown.clone().cancelled_owned())
        .await?;

    // The HTTP server is down; sweep what is left. Closing connections
    // first lets their lifecycles reclaim bound sessions before the final
    // registry sweep.
    info!("shutting down: closing connections and sessions");
    state.connections.close_all();
    state.sessions.cleanup_all().await;
    info!("mirage stopped");

    Ok(())
}

async fn watch_shutdown_signals(shutdown: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }

    info!("received shutdown signal");
    shutdown.cancel();
}
