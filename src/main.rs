use anyhow::Result;
use axum::Router;
use deleted_message_vault::{
    clock::SystemClock,
    config::{AppConfig, Mode},
    handlers::AppState,
    metrics::TracingMetrics,
    routes,
    services::{
        blob_store::FileBlobStore, garbage_collection, metadata_vault::SqliteMetadataVault,
        vault::DeletedMessageVault,
    },
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;
    tracing::info!("Starting deleted message vault with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db_path = cfg
        .database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(
                SqliteConnectOptions::from_str(&cfg.database_url)?.create_if_missing(true),
            )
            .await?,
    );
    let metadata = SqliteMetadataVault::new(db.clone());

    // --- Handle migration mode ---
    if mode == Mode::Migrate {
        metadata.migrate().await?;
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Initialize the vault ---
    let vault = DeletedMessageVault::new(
        Arc::new(FileBlobStore::new(&cfg.storage_dir)),
        Arc::new(metadata),
        Arc::new(SystemClock),
        Arc::new(TracingMetrics),
        cfg.vault.clone(),
    );
    let shutdown = CancellationToken::new();

    if mode == Mode::CollectGarbage {
        let result = vault.garbage_collection_task().run(&shutdown).await;
        println!("{}", serde_json::to_string_pretty(&result)?);
        if result.error.is_some() {
            anyhow::bail!("garbage collection failed");
        }
        return Ok(());
    }

    if let Some(interval) = cfg.gc_interval {
        tokio::spawn(garbage_collection::schedule(
            vault.garbage_collection_task(),
            interval,
            shutdown.clone(),
        ));
    }

    // --- Build router ---
    let state = AppState {
        vault,
        db,
        storage_dir: cfg.storage_dir.clone().into(),
        shutdown: shutdown.clone(),
    };
    let app: Router = routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {}", err);
    }
    tracing::info!("Shutting down");
    shutdown.cancel();
}
