use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use secrecy::ExposeSecret;
use tracing::{error, info, warn};

use item_service::api::create_router_with_rate_limit;
use item_service::app::{AppState, Collaborators, WorkerConfig, spawn_worker};
use item_service::config::AppConfig;
use item_service::infra::{
    FsBlobStore, HttpUserDirectory, NatsConfig, NatsEventPublisher, PostgresClient, init_metrics,
    init_tracing,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let config = AppConfig::from_env().context("invalid configuration")?;
    init_tracing(config.log_format);

    let metrics = match init_metrics() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Metrics recorder not installed");
            None
        }
    };

    let postgres = Arc::new(PostgresClient::with_defaults(config.database_url.expose_secret()).await?);
    postgres.run_migrations().await?;

    let blobs = Arc::new(FsBlobStore::open(&config.blob_root, config.blob_quota_bytes).await?);
    let publisher = Arc::new(NatsEventPublisher::connect(NatsConfig::from(&config.events)).await?);
    let users = Arc::new(HttpUserDirectory::with_defaults(&config.user_service_url)?);

    let mut state = AppState::new(
        Collaborators {
            users,
            items: postgres.clone(),
            ledger: postgres,
            blobs,
            publisher,
        },
        &config,
    );
    if let Some(handle) = metrics {
        state = state.with_metrics(handle);
    }
    let state = Arc::new(state);

    let (worker, worker_shutdown) = spawn_worker(
        Arc::clone(&state.ingestion),
        WorkerConfig::from(&config.reconcile),
    );

    let router = create_router_with_rate_limit(state, config.rate_limit.clone());
    let listener = tokio::net::TcpListener::bind(config.server_addr)
        .await
        .with_context(|| format!("cannot bind {}", config.server_addr))?;
    info!(addr = %config.server_addr, "Item service listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    if worker_shutdown.send(true).is_err() {
        warn!("Announcement worker already stopped");
    }
    if let Err(e) = worker.await {
        error!(error = %e, "Announcement worker panicked");
    }
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT"),
        () = terminate => info!("Received SIGTERM"),
    }
}
