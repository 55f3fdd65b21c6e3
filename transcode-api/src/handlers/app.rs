use std::future::ready;

use axum::{routing, Router};

use transcode_common::health::HealthRegistry;
use transcode_common::store::JobStore;

use crate::dispatch::Dispatcher;
use crate::handlers::job;

#[derive(Clone)]
pub struct AppState {
    pub store: JobStore,
    pub dispatcher: Dispatcher,
    pub max_retries_default: i32,
}

pub fn add_routes(router: Router<AppState>, state: AppState, liveness: HealthRegistry) -> Router {
    router
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route(
            "/_liveness",
            routing::get(move || ready(liveness.get_status())),
        )
        .route("/jobs", routing::post(job::post_job).get(job::list_jobs))
        .route("/jobs/:id", routing::get(job::get_job))
        .with_state(state)
}

pub async fn index() -> &'static str {
    "transcode api"
}
