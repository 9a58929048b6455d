use anyhow::{Context, Result};
use std::sync::Arc;
use tally_service::reconciler::{final_flush, run_flush_loop};
use tally_service::{
    serve_until_shutdown, start_api_server, AppState, Calendar, Config, ImageSlotCache,
    PgDailyRecordStore,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    let timezone = config.timezone()?;

    info!(
        service = %config.service.name,
        timezone = %timezone,
        "Starting Tally Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let store = Arc::new(
        PgDailyRecordStore::new(&config.database)
            .await
            .context("Failed to initialize daily record store")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let images = Arc::new(
        ImageSlotCache::new(config.images.scratch_root.as_deref())
            .context("Failed to create image scratch area")?,
    );

    let state = AppState::new(
        store,
        Calendar::system(timezone),
        images,
        config.service.name.clone(),
    );
    let reconciler = state.reconciler.clone();

    let shutdown = CancellationToken::new();

    // Spawn background flush task
    let flush_handle = config.flush_interval().map(|interval| {
        tokio::spawn(run_flush_loop(
            reconciler.clone(),
            interval,
            shutdown.clone(),
        ))
    });

    // Spawn API server task
    let api_config = config.api.clone();
    let api_shutdown = shutdown.clone();
    let api_handle =
        tokio::spawn(async move { start_api_server(state, &api_config, api_shutdown).await });

    info!("Tally service started successfully");

    // Wait for a shutdown signal, or for the server to exit on its own
    let served = serve_until_shutdown(api_handle, shutdown_signal(), shutdown).await;

    info!("Shutting down tally service");

    if let Some(handle) = flush_handle {
        let _ = handle.await;
    }

    final_flush(&reconciler).await;

    info!("Tally service stopped");

    served
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
