use anyhow::{Context, Result};
use feedback_service::{
    start_api_server, AppState, BlobStore, Config, GalleryService, GeminiAnalyzer,
    ImageAnalyzer, IngestPipeline, MetadataRepository, PgMetadataStore, S3BlobStore,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Ansel feedback service"
    );

    init_metrics(config.service.metrics_port)?;

    let metadata_store = PgMetadataStore::new(&config.database)
        .await
        .context("Failed to initialize metadata store")?;

    if config.database.run_migrations {
        metadata_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let repository: Arc<dyn MetadataRepository> = Arc::new(metadata_store);

    let blob_store: Arc<dyn BlobStore> = Arc::new(
        S3BlobStore::new(&config.s3)
            .await
            .context("Failed to initialize S3 blob store")?,
    );

    let analyzer = GeminiAnalyzer::new(&config.analysis);
    info!(model = %analyzer.model_name(), "Vision analyzer configured");
    let analyzer: Arc<dyn ImageAnalyzer> = Arc::new(analyzer);

    let pipeline = IngestPipeline::new(
        blob_store.clone(),
        analyzer,
        repository.clone(),
        config.s3.bucket.clone(),
        config.ingest.clone(),
    );

    let gallery = GalleryService::new(
        blob_store,
        repository,
        config.presigned_url_expiry(),
        config.api.default_page_size,
        config.api.max_page_size,
    );

    let api_state = AppState {
        pipeline: Arc::new(pipeline),
        gallery: Arc::new(gallery),
        api_key: config.api.api_key.as_deref().map(Arc::from),
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Feedback service started successfully");

    shutdown_signal().await;

    info!("Shutting down feedback service");

    api_handle.abort();

    info!("Feedback service stopped");

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
    metrics_exporter_prometheus::PrometheusBuilder::new()
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
