use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use halyard_core::AppState;
use halyard_data::MemoryDataLayer;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod demo;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("halyard=info")),
        )
        .init();

    let args = cli::Args::parse();
    let config = config::Config::load(&args.config)?;
    let bind_address = args.bind.unwrap_or_else(|| config.server.bind_address.clone());

    let data = Arc::new(MemoryDataLayer::new());
    if args.seed_demo {
        demo::seed(&data);
    }

    let state = AppState::new(data, config.gateway_config());
    let app = halyard_ws::gateway_router().with_state(state);

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!(%bind_address, "gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "failed to install shutdown handler");
        return;
    }
    tracing::info!("shutting down");
}
