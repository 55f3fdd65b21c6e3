use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use config::Config;
use envconfig::Envconfig;
use eyre::Result;

use transcode_common::health::{HealthHandle, HealthRegistry};
use transcode_common::metrics::setup_metrics_routes;
use transcode_common::queue::WorkQueue;
use transcode_common::redis::RedisClient;
use transcode_common::shutdown::wait_for_shutdown_signal;
use transcode_common::store::JobStore;

use crate::dispatch::Dispatcher;
use crate::handlers::AppState;

mod config;
mod dispatch;
mod handlers;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown_signal())
        .await?;

    Ok(())
}

/// The api has no work loop of its own, so the liveness component reports
/// on a timer; a wedged runtime stops reporting and stalls the probe.
async fn report_liveness(handle: HealthHandle, interval: Duration) {
    let mut interval = tokio::time::interval(interval);

    loop {
        interval.tick().await;
        handle.report_healthy().await;
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let liveness = HealthRegistry::new("liveness");
    let api_liveness = liveness
        .register(
            "api".to_string(),
            chrono::Duration::from_std(config.liveness_deadline.0)
                .expect("invalid liveness deadline"),
        )
        .await;
    tokio::spawn(report_liveness(
        api_liveness,
        config.liveness_deadline.0 / 4,
    ));

    let store = JobStore::new(&config.database_url, config.max_pg_connections)
        .await
        .expect("failed to initialize job store");
    let redis = Arc::new(
        RedisClient::new(&config.redis_url).expect("failed to initialize redis client"),
    );
    let dispatcher = Dispatcher::new(WorkQueue::new(redis));

    let state = AppState {
        store,
        dispatcher,
        max_retries_default: config.max_retries_default,
    };

    let app = handlers::add_routes(Router::new(), state, liveness);
    let app = setup_metrics_routes(app);

    match listen(app, config.bind()).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to start transcode-api http server, {}", e),
    }
}
