use anyhow::Result;
use axum::Router;
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use services::{
    chunker::Chunker,
    driver::{AlertSettings, DeliveryDriver},
    heartbeat::Heartbeat,
    ledger::Ledger,
    messenger::{Messenger, TelegramMessenger},
    poller::BucketPoller,
    processor::{FileProcessor, ProcessorSettings},
    rate_limiter::RateLimiter,
    retry_scheduler::{BackoffTable, RetryScheduler},
    sigv4::Credentials,
    storage_client::{ObjectStorage, S3Client, S3Config},
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    install_panic_hook();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = match config::AppConfig::from_env_and_args() {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::error!("Failed to start background worker: {}", err);
            return Err(err.into());
        }
    };

    tracing::info!("Starting bucket-relay with config: {:?}", cfg);

    // --- Ensure staging directory exists ---
    if !cfg.staging_dir.exists() {
        fs::create_dir_all(&cfg.staging_dir)?;
        tracing::info!("Created staging directory at {}", cfg.staging_dir.display());
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    let db_path_obj = Path::new(db_path);
    if let Some(parent) = db_path_obj.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    // SQLx will not create the file itself without `?mode=rwc`.
    if !db_path.starts_with(":memory:") {
        match fs::OpenOptions::new().create(true).append(true).open(db_path) {
            Ok(_) => tracing::debug!("Database file can be created/opened."),
            Err(e) => tracing::warn!("Failed to open database file manually: {}", e),
        }
    }

    let db = Arc::new(SqlitePoolOptions::new().max_connections(5).connect(db_url).await?);
    let ledger = Ledger::new(db);

    // --- Schema ---
    let statements = ledger.migrate().await?;
    tracing::info!("Applied {} schema statements", statements);
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Collaborators, built once ---
    let storage: Arc<dyn ObjectStorage> = Arc::new(S3Client::new(S3Config {
        endpoint: cfg.storage_endpoint.clone(),
        credentials: Credentials {
            access_key: cfg.storage_access_key.clone(),
            secret_key: cfg.storage_secret_key.clone(),
            region: cfg.storage_region.clone(),
        },
        request_timeout: cfg.request_timeout,
    })?);
    let messenger: Arc<dyn Messenger> = Arc::new(TelegramMessenger::new(
        &cfg.telegram_api_url,
        &cfg.telegram_bot_token,
        cfg.request_timeout,
    )?);
    let limiter = Arc::new(RateLimiter::new(cfg.send_interval));
    let retries = RetryScheduler::new(ledger.clone(), BackoffTable::default());

    let processor = Arc::new(FileProcessor::new(
        storage.clone(),
        messenger.clone(),
        ledger.clone(),
        retries.clone(),
        Chunker::new(cfg.split_threshold, cfg.chunk_size)?,
        limiter.clone(),
        ProcessorSettings {
            destination: cfg.telegram_chat_id.clone(),
            staging_dir: cfg.staging_dir.clone(),
            verify_etag: cfg.verify_etag,
        },
    ));

    let driver = Arc::new(DeliveryDriver::new(
        processor,
        storage.clone(),
        messenger.clone(),
        limiter.clone(),
        ledger.clone(),
        retries,
        cfg.request_timeout,
        AlertSettings {
            destination: cfg.alert_on_error.then(|| cfg.telegram_chat_id.clone()),
        },
    ));

    let poller = Arc::new(BucketPoller::new(
        storage,
        ledger.clone(),
        driver,
        cfg.poll_interval_minutes,
        cfg.request_timeout,
    )?);

    // --- Background work ---
    poller.start();
    let background = CancellationToken::new();
    let heartbeat = Heartbeat::new(
        ledger.clone(),
        messenger,
        limiter,
        cfg.telegram_chat_id.clone(),
        cfg.heartbeat_hours,
    )
    .map(|hb| hb.spawn(background.clone()));
    tracing::info!("Background worker started successfully");

    // --- Build router ---
    let state = routes::routes::AppState {
        ledger,
        staging_dir: cfg.staging_dir.clone(),
        poll_interval_minutes: cfg.poll_interval_minutes,
        started_at: Utc::now(),
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
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // --- Shutdown: let the in-flight cycle finish ---
    poller.stop().await;
    background.cancel();
    if let Some(handle) = heartbeat {
        if let Err(err) = handle.await {
            tracing::warn!("Heartbeat task ended abnormally: {}", err);
        }
    }
    tracing::info!("Background worker stopped");

    Ok(())
}

/// Panics are logged; the process keeps running.
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let payload = info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        tracing::error!(location = %location, "Uncaught panic: {}", payload);
    }));
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("Failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down gracefully..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down gracefully..."),
    }
}
