//! rtsync server - real-time collaborative text synchronization
//!
//! A sync server using:
//! - Character-level Myers diffs as the unit of collaboration
//! - A single authoritative in-memory copy of every file
//! - Axum WebSockets with bounded, non-blocking fan-out
//! - Sled for metadata and the filesystem for file contents

use anyhow::Context;
use std::sync::Arc;
use tracing::info;

mod auth;
mod config;
mod http;
mod storage;
mod sync;

use auth::{TokenConfig, TokenService};
use config::ServerConfig;
use http::AppState;
use storage::{DiskStorage, ObjectStorage, Repository, SledRepository};
use sync::connection::OriginPolicy;
use sync::{Hub, PersistenceDrain};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rtsync_server=info,tower_http=info".into()),
        )
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();
    let config = ServerConfig::from_env().context("Invalid configuration")?;

    // Initialize storage
    info!("Opening metadata store at: {}", config.database_path);
    let storage_config = config.storage();
    let repo: Arc<dyn Repository> = Arc::new(
        SledRepository::open(&storage_config).context("Failed to open metadata store")?,
    );

    let disk = DiskStorage::new(&storage_config.objects_dir);
    disk.init().await.context("Failed to initialize object storage")?;
    info!("Object storage at: {}", disk.root().display());
    let storage: Arc<dyn ObjectStorage> = Arc::new(disk);

    // Load every known file before accepting connections
    let (hub, persist_rx) = Hub::new(repo.clone(), storage.clone(), config.hub.clone());
    let hub = Arc::new(hub);
    let files = hub
        .hydrate()
        .await
        .context("Failed to load file state")?;
    info!("Loaded {} files", files);

    let drain = PersistenceDrain::new(repo.clone(), storage.clone(), persist_rx)
        .spawn(hub.shutdown_receiver());

    let tokens = TokenService::new(TokenConfig::new(config.jwt_secret.clone()))
        .context("Invalid token configuration")?;

    let state = Arc::new(AppState {
        hub: hub.clone(),
        repo,
        storage,
        tokens: Arc::new(tokens),
        origins: OriginPolicy::new(config.allowed_origins.clone()),
    });
    let app = http::router(state);

    let addr = config.addr()?;
    info!("rtsync server v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Listening on: http://{}", addr);
    info!("   WebSocket: ws://{}/v1/sync", addr);
    info!("   Health check: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let shutdown_hub = hub.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            shutdown_hub.shutdown();
        })
        .await
        .context("Server error")?;

    drain.await.context("Persistence drain panicked")?;
    info!("Server stopped");
    Ok(())
}
