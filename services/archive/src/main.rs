use anyhow::{Context, Result};
use archive_service::api::{start_api_server, AppState};
use archive_service::config::{Config, StorageBackend};
use archive_service::{
    AccessGate, ArchiveIndex, ArchiveJob, CronScheduler, FilterPipeline, MemoryObjectStore,
    ObjectStore, PathScheme, PgLogStore, RetentionSweeper, S3ObjectStore, SearchService,
    SweepOutcome,
};
use chrono::Utc;
use futures::FutureExt;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Log Archive Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let log_store = Arc::new(
        PgLogStore::new(&config.database)
            .await
            .context("Failed to initialize log store")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        log_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }
    let db_pool = log_store.pool().clone();

    let store: Arc<dyn ObjectStore> = match config.storage.backend {
        StorageBackend::S3 => Arc::new(
            S3ObjectStore::new(&config.storage)
                .await
                .context("Failed to initialize S3 object store")?,
        ),
        StorageBackend::Memory => {
            warn!("Using in-memory object store, archived files are lost on restart");
            Arc::new(MemoryObjectStore::new())
        }
    };

    let scheme = Arc::new(
        PathScheme::new(config.archive.clone()).context("Invalid archive layout")?,
    );
    let gate = Arc::new(AccessGate::new(&config.access));
    let index = ArchiveIndex::new(store.clone(), scheme.clone());

    let search = Arc::new(SearchService::new(
        gate.clone(),
        index.clone(),
        FilterPipeline::new(store.clone(), config.query.content_search_concurrency),
        config.default_query_deadline(),
    ));
    let archive_job = Arc::new(ArchiveJob::new(
        log_store.clone(),
        store.clone(),
        scheme.clone(),
    ));
    let retention = Arc::new(RetentionSweeper::new(
        log_store.clone(),
        store.clone(),
        index,
        config.retention.clone(),
    ));

    // Register scheduled jobs
    let scheduler = Arc::new(CronScheduler::new());

    if config.jobs.archive_enabled {
        let job = archive_job.clone();
        scheduler
            .schedule(
                &config.jobs.archive_cron,
                "archive:hourly",
                Arc::new(move || {
                    let job = job.clone();
                    async move {
                        let hour_start = ArchiveJob::previous_hour(Utc::now());
                        if let Err(e) = job.run_hour(hour_start).await {
                            error!(error = %e, %hour_start, "Scheduled archive run failed");
                        }
                    }
                    .boxed()
                }),
            )
            .context("Failed to schedule archive job")?;
    }

    if config.retention.enabled {
        let expression = config
            .retention
            .schedule_expression()
            .context("Invalid retention schedule")?;
        let sweeper = retention.clone();
        scheduler
            .schedule(
                &expression,
                "retention:sweep",
                Arc::new(move || {
                    let sweeper = sweeper.clone();
                    async move {
                        if let SweepOutcome::Completed(report) = sweeper.run_once(Utc::now()).await {
                            if report.is_partial_failure() {
                                warn!(
                                    failures = report.failures.len(),
                                    "Retention sweep finished with skipped batches"
                                );
                            }
                        }
                    }
                    .boxed()
                }),
            )
            .context("Failed to schedule retention sweep")?;
    }

    // Create API state
    let api_state = AppState {
        search,
        gate,
        store,
        scheme,
        archive_job,
        retention: retention.clone(),
        scheduler: scheduler.clone(),
        db_pool: Some(db_pool),
        presigned_url_expiry: config.presigned_url_expiry(),
    };

    // Spawn API server task
    let api_shutdown = CancellationToken::new();
    let api_config = config.api.clone();
    let server_shutdown = api_shutdown.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, server_shutdown).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Archive service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down archive service");

    // Sweeper first so a sweep in progress stops after its current batch
    retention.shutdown().await;
    scheduler.shutdown(config.job_shutdown_grace()).await;
    api_shutdown.cancel();
    if let Err(e) = api_handle.await {
        warn!(error = %e, "API server task did not exit cleanly");
    }

    info!("Archive service stopped");

    Ok(())
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
            Ok(mut stream) => {
                stream.recv().await;
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
