//! Consume the pending queue and run transcode jobs.
use std::future::ready;
use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use transcode_common::health::HealthRegistry;
use transcode_common::lease::LeaseRegistry;
use transcode_common::metrics::{serve, setup_metrics_routes};
use transcode_common::queue::WorkQueue;
use transcode_common::redis::RedisClient;
use transcode_common::shutdown::wait_for_shutdown_signal;
use transcode_common::store::JobStore;
use transcode_worker::config::Config;
use transcode_worker::encoder::FfmpegTranscoder;
use transcode_worker::storage::S3ObjectStore;
use transcode_worker::worker::{TranscodeWorker, WorkerSettings};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");
    let worker_id = Uuid::new_v4();

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register("worker".to_string(), chrono::Duration::seconds(60))
        .await;

    let store = JobStore::new(&config.database_url, config.max_pg_connections)
        .await
        .expect("failed to initialize job store");
    let redis = Arc::new(
        RedisClient::new(&config.redis_url).expect("failed to initialize redis client"),
    );
    let queue = WorkQueue::new(redis.clone());
    let leases = LeaseRegistry::new(redis);
    let storage = Arc::new(
        S3ObjectStore::new(config.s3_bucket.clone(), config.s3_endpoint_url.clone()).await,
    );
    let encoder = Arc::new(FfmpegTranscoder::new(PathBuf::from(&config.ffmpeg_path)));

    let settings = WorkerSettings {
        stall_horizon: chrono::Duration::from_std(config.stall_horizon.0)
            .expect("invalid stall horizon"),
        lease_ttl: config.lease_ttl.0,
        lease_renew_interval: config.lease_renew_interval.0,
        queue_pop_timeout: config.queue_pop_timeout.0,
        backoff: config.backoff_schedule.clone(),
        scratch_root: config
            .scratch_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir),
    };

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            shutdown.cancel();
        });
    }

    let worker = TranscodeWorker::new(
        worker_id,
        store,
        queue,
        leases,
        storage,
        encoder,
        settings,
        worker_liveness,
        shutdown,
    );

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = setup_metrics_routes(router);
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    info!(worker_id = %worker_id, "transcode worker starting");
    worker.run().await;
    info!(worker_id = %worker_id, "transcode worker exiting");
}

pub async fn index() -> &'static str {
    "transcode worker"
}
