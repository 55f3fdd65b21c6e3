//! # JobStore
//!
//! Durable, transactional record of jobs and their renditions, backed by
//! PostgreSQL. The store is the source of truth for terminal state and
//! retry counters; ownership transfers happen exclusively through the
//! conditional update in [`JobStore::claim_job`].

use chrono::{Duration, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use uuid::Uuid;

use crate::job::{Job, JobStatus, Rendition};

/// Enumeration of errors for operations on the JobStore.
/// Errors that can originate from sqlx are wrapped to provide the failing command.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("job {0} is owned by another worker or already terminal")]
    AlreadyClaimed(Uuid),
    #[error("job {0} does not permit this transition")]
    InvalidTransition(Uuid),
    #[error("job {0} has no retries remaining")]
    RetriesExhausted(Uuid),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

fn query_error(command: &str) -> impl FnOnce(sqlx::Error) -> StoreError + '_ {
    move |error| StoreError::QueryError {
        command: command.to_owned(),
        error,
    }
}

/// The outcome a worker reports when finalizing a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
}

#[derive(Clone)]
pub struct JobStore {
    pool: PgPool,
}

impl JobStore {
    /// Initialize a new JobStore by connecting to a PostgreSQL database.
    pub async fn new(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(url)
            .map_err(|error| StoreError::PoolCreationError { error })?;

        Ok(Self { pool })
    }

    /// Initialize a new JobStore from an existing connection pool.
    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a Job row in `queued` plus one Rendition row per requested
    /// resolution, in a single transaction.
    pub async fn create_job(
        &self,
        input_key: &str,
        resolutions: &[String],
        max_retries: i32,
    ) -> StoreResult<Job> {
        if input_key.is_empty() {
            return Err(StoreError::InvalidInput("input_key is empty".to_owned()));
        }
        if resolutions.is_empty() {
            return Err(StoreError::InvalidInput(
                "at least one resolution is required".to_owned(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for resolution in resolutions {
            if !seen.insert(resolution.as_str()) {
                return Err(StoreError::InvalidInput(format!(
                    "duplicate resolution: {}",
                    resolution
                )));
            }
        }
        if max_retries < 0 {
            return Err(StoreError::InvalidInput(
                "max_retries must be non-negative".to_owned(),
            ));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(query_error("BEGIN create_job"))?;

        let job: Job = sqlx::query_as(
            r#"
INSERT INTO jobs (id, input_key, status, max_retries)
VALUES ($1, $2, 'queued'::job_status, $3)
RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(input_key)
        .bind(max_retries)
        .fetch_one(&mut *tx)
        .await
        .map_err(query_error("INSERT jobs"))?;

        for resolution in resolutions {
            sqlx::query(
                r#"
INSERT INTO renditions (id, job_id, resolution)
VALUES ($1, $2, $3)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(job.id)
            .bind(resolution)
            .execute(&mut *tx)
            .await
            .map_err(query_error("INSERT renditions"))?;
        }

        tx.commit()
            .await
            .map_err(query_error("COMMIT create_job"))?;

        Ok(job)
    }

    pub async fn get_job(&self, id: Uuid) -> StoreResult<Job> {
        sqlx::query_as("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error("SELECT jobs"))?
            .ok_or(StoreError::NotFound(id))
    }

    pub async fn list_renditions(&self, job_id: Uuid) -> StoreResult<Vec<Rendition>> {
        sqlx::query_as(
            "SELECT * FROM renditions WHERE job_id = $1 ORDER BY resolution ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("SELECT renditions"))
    }

    /// List jobs for inspection, newest first, optionally filtered by status.
    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<Job>> {
        match status {
            Some(status) => sqlx::query_as(
                r#"
SELECT * FROM jobs
WHERE status = $1
ORDER BY created_at DESC
LIMIT $2 OFFSET $3
                "#,
            )
            .bind(status)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(query_error("SELECT jobs")),
            None => sqlx::query_as(
                "SELECT * FROM jobs ORDER BY created_at DESC LIMIT $1 OFFSET $2",
            )
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(query_error("SELECT jobs")),
        }
    }

    /// Atomically transfer ownership of a job to `worker_id`.
    ///
    /// The predicate is evaluated server-side in a single statement: the
    /// claim succeeds iff the row is `queued`, or `processing` with a
    /// `started_at` older than `stall_horizon` (a previous owner stalled
    /// or crashed). A returned row means the caller owns the job; no row
    /// means another worker does.
    pub async fn claim_job(
        &self,
        id: Uuid,
        worker_id: Uuid,
        stall_horizon: Duration,
    ) -> StoreResult<Job> {
        let stalled_before = Utc::now() - stall_horizon;

        let claimed: Option<Job> = sqlx::query_as(
            r#"
UPDATE jobs
SET
    status = 'processing'::job_status,
    worker_id = $2,
    started_at = NOW(),
    error_message = NULL,
    updated_at = NOW()
WHERE
    id = $1
    AND (
        status = 'queued'::job_status
        OR (status = 'processing'::job_status AND started_at < $3)
    )
RETURNING *
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(stalled_before)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error("UPDATE claim_job"))?;

        claimed.ok_or(StoreError::AlreadyClaimed(id))
    }

    /// Record a rendition's uploaded output locator.
    ///
    /// Idempotent: assigning the same locator a second time is a no-op
    /// success. The update is refused once the parent job is terminal, or
    /// if a different locator was already recorded.
    pub async fn complete_rendition(
        &self,
        rendition_id: Uuid,
        output_key: &str,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
UPDATE renditions
SET output_key = $2
FROM jobs
WHERE
    renditions.id = $1
    AND jobs.id = renditions.job_id
    AND jobs.status = 'processing'::job_status
    AND (renditions.output_key IS NULL OR renditions.output_key = $2)
            "#,
        )
        .bind(rendition_id)
        .bind(output_key)
        .execute(&self.pool)
        .await
        .map_err(query_error("UPDATE complete_rendition"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::InvalidTransition(rendition_id));
        }

        Ok(())
    }

    /// Transition a job into its terminal state. On `Failed` the provided
    /// error is recorded as the job's user-visible `error_message`.
    ///
    /// Terminal states are absorbing: finalizing an already-terminal job
    /// is refused rather than overwritten.
    pub async fn finalize_job(
        &self,
        id: Uuid,
        outcome: JobOutcome,
        error: Option<&str>,
    ) -> StoreResult<Job> {
        let status = match outcome {
            JobOutcome::Completed => JobStatus::Completed,
            JobOutcome::Failed => JobStatus::Failed,
        };
        let error_message = match outcome {
            JobOutcome::Completed => None,
            JobOutcome::Failed => error,
        };

        let finalized: Option<Job> = sqlx::query_as(
            r#"
UPDATE jobs
SET
    status = $2,
    error_message = $3,
    updated_at = NOW()
WHERE
    id = $1
    AND status NOT IN ('completed'::job_status, 'failed'::job_status)
RETURNING *
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(error_message)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error("UPDATE finalize_job"))?;

        finalized.ok_or(StoreError::InvalidTransition(id))
    }

    /// Return a processing job to `queued` and consume one retry.
    ///
    /// Clears the owner fields so the re-queued row satisfies the queued
    /// invariant. The retry-budget guard is repeated here so a racing
    /// caller can never push `retry_count` past `max_retries`.
    pub async fn increment_retry(&self, id: Uuid) -> StoreResult<Job> {
        let requeued: Option<Job> = sqlx::query_as(
            r#"
UPDATE jobs
SET
    status = 'queued'::job_status,
    worker_id = NULL,
    started_at = NULL,
    retry_count = retry_count + 1,
    updated_at = NOW()
WHERE
    id = $1
    AND status = 'processing'::job_status
    AND retry_count < max_retries
RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error("UPDATE increment_retry"))?;

        requeued.ok_or(StoreError::RetriesExhausted(id))
    }

    /// Processing jobs whose claim is older than `horizon`. These are
    /// candidates for re-queueing by the sweeper; the claim predicate in
    /// [`JobStore::claim_job`] is what actually transfers ownership.
    pub async fn find_stalled_jobs(&self, horizon: Duration) -> StoreResult<Vec<Job>> {
        let stalled_before = Utc::now() - horizon;

        sqlx::query_as(
            r#"
SELECT * FROM jobs
WHERE status = 'processing'::job_status AND started_at < $1
ORDER BY started_at ASC
            "#,
        )
        .bind(stalled_before)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("SELECT find_stalled_jobs"))
    }

    /// Identifiers of all currently `queued` jobs, for reconciliation
    /// against the pending queue's contents.
    pub async fn list_queued_job_ids(&self) -> StoreResult<Vec<Uuid>> {
        sqlx::query_scalar("SELECT id FROM jobs WHERE status = 'queued'::job_status")
            .fetch_all(&self.pool)
            .await
            .map_err(query_error("SELECT list_queued_job_ids"))
    }
}
