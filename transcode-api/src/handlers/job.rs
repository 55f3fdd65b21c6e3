use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use serde_derive::Deserialize;
use tracing::{debug, error};
use uuid::Uuid;

use transcode_common::job::{Job, JobStatus, Rendition};
use transcode_common::store::StoreError;

use crate::handlers::app::AppState;

const DEFAULT_RESOLUTIONS: [&str; 3] = ["480p", "720p", "1080p"];

const MAX_PAGE_SIZE: i64 = 100;

#[derive(Serialize, Deserialize)]
pub struct ErrorResponse {
    error: String,
}

/// The body of a request made to submit a transcode Job.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct JobPostRequestBody {
    input_key: String,

    /// Requested output resolutions. Empty means the default ladder.
    #[serde(default)]
    resolutions: Vec<String>,

    /// Per-job retry budget; defaults from configuration and is immutable
    /// after creation.
    max_retries: Option<i32>,
}

#[derive(Serialize, Deserialize)]
pub struct JobPostResponse {
    pub job_id: Uuid,
}

pub async fn post_job(
    State(state): State<AppState>,
    Json(payload): Json<JobPostRequestBody>,
) -> Result<Json<JobPostResponse>, (StatusCode, Json<ErrorResponse>)> {
    debug!("received payload: {:?}", payload);

    let resolutions = if payload.resolutions.is_empty() {
        DEFAULT_RESOLUTIONS.iter().map(|r| r.to_string()).collect()
    } else {
        payload.resolutions
    };
    let max_retries = payload.max_retries.unwrap_or(state.max_retries_default);

    let start_time = Instant::now();

    let job = state
        .store
        .create_job(&payload.input_key, &resolutions, max_retries)
        .await
        .map_err(|err| match err {
            StoreError::InvalidInput(message) => bad_request(&message),
            other => internal_error(other),
        })?;

    // Enqueue after the insert commits; dispatch failures self-heal via
    // the sweeper.
    state.dispatcher.dispatch(job.id).await;

    let elapsed_time = start_time.elapsed().as_secs_f64();
    metrics::histogram!("transcode_api_submit_duration_seconds").record(elapsed_time);

    Ok(Json(JobPostResponse { job_id: job.id }))
}

#[derive(Serialize)]
pub struct JobDetailResponse {
    #[serde(flatten)]
    pub job: Job,
    pub renditions: Vec<Rendition>,
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobDetailResponse>, (StatusCode, Json<ErrorResponse>)> {
    let job = state.store.get_job(id).await.map_err(|err| match err {
        StoreError::NotFound(_) => not_found(id),
        other => internal_error(other),
    })?;
    let renditions = state
        .store
        .list_renditions(id)
        .await
        .map_err(internal_error)?;

    Ok(Json(JobDetailResponse { job, renditions }))
}

#[derive(Deserialize, Debug)]
pub struct ListJobsQuery {
    status: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<Job>,
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<JobListResponse>, (StatusCode, Json<ErrorResponse>)> {
    let status = match &query.status {
        None => None,
        Some(raw) => Some(
            raw.parse::<JobStatus>()
                .map_err(|message| bad_request(&message))?,
        ),
    };
    let limit = query.limit.unwrap_or(50).clamp(1, MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0).max(0);

    let jobs = state
        .store
        .list_jobs(status, limit, offset)
        .await
        .map_err(internal_error)?;

    Ok(Json(JobListResponse { jobs }))
}

fn bad_request(msg: &str) -> (StatusCode, Json<ErrorResponse>) {
    error!(msg);
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: msg.to_owned(),
        }),
    )
}

fn not_found(id: Uuid) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("job {} not found", id),
        }),
    )
}

fn internal_error<E>(err: E) -> (StatusCode, Json<ErrorResponse>)
where
    E: std::error::Error,
{
    error!("internal error: {}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}
