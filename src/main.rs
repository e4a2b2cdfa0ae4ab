use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{fmt, EnvFilter};

use thumbnail_service::config::{AppSettings, BucketsMap};
use thumbnail_service::handlers::{build_router, AppState, VERSION};
use thumbnail_service::health::HealthState;
use thumbnail_service::provision::BucketsService;
use thumbnail_service::stats::{known_buckets, StatService, StatsLayerState};
use thumbnail_service::storage::{S3StorageClient, StorageClient};
use thumbnail_service::thumbnails::ThumbnailService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = AppSettings::load().context("Failed to load configuration")?;
    init_tracing(&settings);

    tracing::info!(
        version = VERSION,
        s3_endpoint = %settings.s3.endpoint,
        source_bucket = settings.source_bucket.as_deref().unwrap_or("<undefined>"),
        "Starting thumbnail service"
    );
    for (bucket, bucket_cfg) in &settings.buckets {
        tracing::info!(
            source = %bucket_cfg.source_bucket,
            bucket = %bucket,
            alias = bucket_cfg.alias.as_deref().unwrap_or("-"),
            size = %bucket_cfg.size,
            "Configured bucket"
        );
    }

    let buckets_map = Arc::new(BucketsMap::derive(&settings).context("Invalid bucket configuration")?);
    let storage: Arc<dyn StorageClient> =
        Arc::new(S3StorageClient::from_settings(&settings.s3).await);

    // One-shot provisioning; the outcome only surfaces through /health
    let buckets_service = BucketsService::new(storage.clone(), buckets_map.clone());
    let buckets_info = buckets_service.create_buckets().await;
    if buckets_info.error {
        tracing::warn!("Some buckets could not be provisioned, health will report degraded");
    }
    let health = Arc::new(HealthState::new());
    health.set_buckets_info(buckets_info);

    let stats = StatService::connect(&settings.sqlite)
        .await
        .context("Failed to initialize the stats database")?;
    let stats_state = StatsLayerState {
        stats,
        known_buckets: Arc::new(known_buckets(&buckets_map)),
    };

    let state = AppState {
        thumbnails: Arc::new(ThumbnailService::new(storage, buckets_map)),
        health,
    };
    let app = build_router(state, stats_state);

    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port)
        .parse()
        .context("Invalid server host/port")?;
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                tracing::error!(port = settings.server.port, "Port is already in use. Another thumbnail-service might be running. Try changing SERVER__PORT or stop the other process.");
            }
            return Err(e.into());
        }
    };
    tracing::info!(host = %settings.server.host, port = settings.server.port, "Thumbnail service listening");
    axum::serve(listener, app).await?;

    Ok(())
}

fn init_tracing(settings: &AppSettings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone()));
    let builder = fmt().with_env_filter(filter);
    if settings.log_fmt == "json" {
        builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .init();
    } else {
        builder.init();
    }
}
