use anyhow::Result;
use axum::Router;
use chrono::TimeDelta;
use std::{fs, io::ErrorKind, path::PathBuf, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use virtual_storage::{
    config::AppConfig,
    db, routes,
    services::{
        backend::BackendRegistry,
        converter::select_converter,
        fs_backend::FileSystemBackend,
        retention::{RetentionConfig, RetentionSweep},
        storage_service::StorageService,
        url_signer::UrlSigner,
        versions::{VersionManager, WorkerPoolConfig},
    },
    state::AppState,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting virtual-storage with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    let storage_dir = PathBuf::from(&cfg.storage_dir);
    if !storage_dir.exists() {
        fs::create_dir_all(&storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    tracing::debug!("Connecting using raw URL => {}", cfg.database_url);
    let db = Arc::new(db::connect(&cfg.database_url).await?);

    // --- Handle migration mode ---
    if migrate {
        db::run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }
    db::run_migrations(&db).await?;

    // --- Initialize core services ---
    let backends = BackendRegistry::new().register(Arc::new(FileSystemBackend::new(&storage_dir)));
    let signer = UrlSigner::new(cfg.shared_secret.clone())?;
    let storage = StorageService::new(db.clone(), cfg.buckets.clone(), backends, signer)?;

    let versions = VersionManager::new(
        storage.clone(),
        select_converter(cfg.conversion_command.clone(), cfg.extend_option.clone()),
        WorkerPoolConfig {
            workers: cfg.version_workers,
            queue_capacity: cfg.version_queue,
        },
    );

    RetentionSweep::new(
        storage.clone(),
        RetentionConfig {
            temporary_grace: TimeDelta::minutes(cfg.temporary_grace_minutes),
            batch_size: cfg.sweep_batch,
        },
    )
    .spawn(Duration::from_secs(cfg.sweep_interval_secs.max(1)));

    // --- Build router ---
    let state = AppState {
        storage,
        versions,
        storage_dir,
        public_url: cfg.public_url.clone(),
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
    axum::serve(listener, app).await?;

    Ok(())
}
