use anyhow::Result;
use axum::Router;
use std::io::ErrorKind;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use services::deposit_service::DepositService;
use services::finalizer::{DepositFinalizerManager, FinalizerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config ---
    let cfg = config::AppConfig::from_env_and_args()?;
    tracing::info!("Starting deposit-store with config: {:?}", cfg);

    let service_cfg = config::ServiceConfig::load(&cfg.config_path)?;

    // --- Ensure intake and archive directories exist ---
    for collection in &service_cfg.collections {
        for dir in [&collection.uploads, &collection.deposits] {
            if !dir.exists() {
                std::fs::create_dir_all(dir)?;
                tracing::info!("Created directory {}", dir.display());
            }
        }
    }

    // --- Initialize core service + finalization scheduler ---
    let file_service = services::file_service::FileService;
    for collection in &service_cfg.collections {
        // a cross-device intake -> archive move would not be atomic
        if !file_service
            .is_same_filesystem(&collection.uploads, &collection.deposits)
            .await?
        {
            anyhow::bail!(
                "collection {}: uploads and deposits must be on the same filesystem",
                collection.name
            );
        }
    }

    let (queue_tx, queue_rx) = mpsc::channel(service_cfg.queue_capacity);
    let deposits = DepositService::new(
        service_cfg.collections.clone(),
        service_cfg.users.clone(),
        queue_tx.clone(),
        service_cfg.email.clone(),
    );

    let finalizer_cfg = FinalizerConfig {
        finalizer_workers: service_cfg.finalizer_workers,
        rescheduler_workers: service_cfg.rescheduler_workers,
        reschedule_delay: service_cfg.reschedule_delay(),
    };
    let mut finalizer =
        DepositFinalizerManager::new(deposits.clone(), queue_tx, queue_rx, finalizer_cfg);
    finalizer.start().await;

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(deposits);

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

    // drain in-flight finalizations before exiting
    finalizer.stop().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("unable to listen for shutdown signal: {err}");
    }
    tracing::info!("shutdown signal received");
}
