mod api;
mod collab;
mod config;
mod db;
mod engine;
mod error;
mod http;
mod monitor;
mod proxy;
mod queue;
mod scanner;
mod types;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::api::router;
use crate::config::Config;
use crate::engine::Engine;
use crate::error::Result;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    let api_port = cfg.api_port;
    let engine = Engine::build(cfg).await?;
    let cancel = engine.cancel_token();

    // --- Signal handling ---
    tokio::spawn(shutdown_on_ctrl_c(cancel.clone()));

    // --- HTTP API server ---
    let app = router(engine.api_state());
    let bind_addr = format!("0.0.0.0:{api_port}");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");
    let api_cancel = cancel.clone();
    let api = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { api_cancel.cancelled().await })
            .await
    });

    // --- Engine loops (returns after shutdown) ---
    let summary = engine.run().await;
    info!(
        uptime_secs = summary.uptime_secs,
        deals = summary.deals_found,
        restocks = summary.restocks_found,
        "Shutdown complete"
    );

    match api.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(e) => {
            error!("HTTP API task failed: {e}");
            Ok(())
        }
    }
}

async fn shutdown_on_ctrl_c(cancel: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl-C received, shutting down"),
        Err(e) => error!("Listening for Ctrl-C failed, shutting down: {e}"),
    }
    cancel.cancel();
}
