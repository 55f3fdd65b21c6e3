use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Enumeration of possible statuses for a Job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "job_status", rename_all = "lowercase")]
pub enum JobStatus {
    /// A job waiting in the pending queue to be picked up by a worker.
    Queued,
    /// A job claimed by a worker and currently being transcoded.
    Processing,
    /// A terminal job with at least one rendition uploaded.
    Completed,
    /// A terminal job that exhausted its retry budget.
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            invalid => Err(format!("{} is not a valid JobStatus", invalid)),
        }
    }
}

/// A submitted transcoding request, as stored in the `jobs` table.
///
/// The row is the source of truth for job state. A `queued` job has no
/// owner (`worker_id` and `started_at` are null); both are set by the
/// atomic claim and cleared again when the job is re-queued for retry.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Job {
    /// A unique id identifying a job.
    pub id: Uuid,
    /// Object-store locator of the source media.
    pub input_key: String,
    /// The current status of the job.
    pub status: JobStatus,
    /// Populated once, on the transition into `failed`.
    pub error_message: Option<String>,
    /// Number of retries consumed so far. Never exceeds `max_retries`.
    pub retry_count: i32,
    /// The retry budget fixed at submission time.
    pub max_retries: i32,
    /// When the current owner claimed the job. Null while queued.
    pub started_at: Option<DateTime<Utc>>,
    /// The worker currently holding the claim. Null while queued.
    pub worker_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Whether a retry may still be scheduled for this job.
    pub fn has_retries_remaining(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// One requested output resolution of a job.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Rendition {
    pub id: Uuid,
    pub job_id: Uuid,
    /// Opaque profile identifier, e.g. `480p`.
    pub resolution: String,
    /// Object-store locator of the transcoded output. Set exactly once,
    /// when the upload for this rendition has succeeded.
    pub output_key: Option<String>,
}
