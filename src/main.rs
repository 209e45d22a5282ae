use std::sync::Arc;

use anyhow::Context;
use helpline::{api::server::ApiServer, config::Config, manager::SupportDesk, store::SqliteStore};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    if let Err(e) = dotenvy::dotenv() {
        info!("No .env file found or failed to load: {}", e);
    }

    // Initialize logging with default filter if RUST_LOG is not set
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    info!("Helpline daemon starting...");

    let config = Config::from_env().context("invalid configuration")?;

    info!("Initializing store at {}", config.database_path.display());
    let store = Arc::new(SqliteStore::new(&config.database_path).await?);
    store.init().await?;

    let desk = Arc::new(SupportDesk::new(
        store.clone(),
        store.clone(),
        store.clone(),
        &config,
    ));

    desk.resume().await.context("failed to resume waiting chats")?;

    let reaper_desk = desk.clone();
    let reaper_handle = tokio::spawn(async move {
        reaper_desk.start_reaper().await;
    });

    let app = ApiServer::new(desk.clone()).router();

    info!("Starting HTTP server on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        res = axum::serve(listener, app) => {
            if let Err(e) = res {
                error!("Server stopped with error: {}", e);
            }
        }
    }

    desk.shutdown().await;
    if let Err(e) = reaper_handle.await {
        error!("Idle reaper task failed: {}", e);
    }

    Ok(())
}
