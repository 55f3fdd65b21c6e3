use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use config::Config;
use envconfig::Envconfig;
use eyre::Result;
use sweeper::Sweeper;
use tracing::{error, info};

use transcode_common::health::{HealthHandle, HealthRegistry};
use transcode_common::lease::LeaseRegistry;
use transcode_common::metrics::setup_metrics_routes;
use transcode_common::queue::WorkQueue;
use transcode_common::redis::RedisClient;
use transcode_common::shutdown::wait_for_shutdown_signal;
use transcode_common::store::JobStore;

mod config;
mod sweeper;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

async fn sweep_loop(sweeper: Sweeper, liveness: HealthHandle, interval: Duration) {
    let mut interval = tokio::time::interval(interval);

    loop {
        interval.tick().await;

        if let Err(e) = sweeper.run_once().await {
            // A few failed sweeps in a row will stall the liveness probe.
            error!("sweep failed with: {}", e);
        } else {
            liveness.report_healthy().await;
        }
    }
}

pub fn app(liveness: HealthRegistry) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
}

async fn index() -> &'static str {
    "transcode janitor"
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let liveness = HealthRegistry::new("liveness");
    let sweeper_liveness = liveness
        .register(
            "sweeper".to_string(),
            chrono::Duration::from_std(config.sweeper_interval.0 * 4)
                .expect("invalid sweeper interval"),
        )
        .await;

    let store = JobStore::new(&config.database_url, config.max_pg_connections)
        .await
        .expect("failed to initialize job store");
    let redis = Arc::new(
        RedisClient::new(&config.redis_url).expect("failed to initialize redis client"),
    );
    let queue = WorkQueue::new(redis.clone());
    let leases = LeaseRegistry::new(redis);

    let sweeper = Sweeper::new(
        store,
        queue,
        leases,
        chrono::Duration::from_std(config.stall_horizon.0).expect("invalid stall horizon"),
    );

    info!("janitor starting, sweeping every {:?}", config.sweeper_interval.0);

    let sweep_loop = tokio::spawn(sweep_loop(
        sweeper,
        sweeper_liveness,
        config.sweeper_interval.0,
    ));

    let app = setup_metrics_routes(app(liveness));
    let http_server = tokio::spawn(listen(app, config.bind()));

    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            info!("shutting down");
        }
        res = sweep_loop => {
            error!("sweep loop exited");
            if let Err(e) = res {
                error!("sweep loop failed with: {}", e)
            }
        }
        res = http_server => {
            error!("http server exited");
            if let Err(e) = res {
                error!("server failed with: {}", e)
            }
        }
    }

    info!("exiting");
}
