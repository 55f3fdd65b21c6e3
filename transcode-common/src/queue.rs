//! # WorkQueue
//!
//! Ordered, blocking handoff of job identifiers from submission to
//! workers, backed by two lists in the coordination service: the pending
//! queue and the dead-letter queue. The lists carry nothing but job
//! identifiers; the job store holds all payload.
//!
//! Delivery is at-least-once. A consumer that crashes between popping a
//! token and claiming the row loses the token, and the sweeper re-pushes
//! the stalled job once its claim ages past the stall horizon.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use crate::redis::{Client, CoordinationResult};

pub const PENDING_QUEUE_KEY: &str = "jobs:pending";
pub const DEAD_LETTER_QUEUE_KEY: &str = "jobs:dead";

#[derive(Clone)]
pub struct WorkQueue {
    client: Arc<dyn Client>,
}

impl WorkQueue {
    pub fn new(client: Arc<dyn Client>) -> Self {
        Self { client }
    }

    /// Append a job identifier to the head of the pending queue.
    pub async fn push(&self, job_id: Uuid) -> CoordinationResult<()> {
        self.client
            .push_front(PENDING_QUEUE_KEY, &job_id.to_string())
            .await
    }

    /// Pop the oldest pending identifier, blocking up to `timeout`.
    ///
    /// Returns `None` on timeout. Tokens that do not parse as identifiers
    /// are dropped here: they can never match a job row, and handing them
    /// back to the queue would cycle forever.
    pub async fn blocking_pop(&self, timeout: Duration) -> CoordinationResult<Option<Uuid>> {
        let popped = self
            .client
            .blocking_pop_back(PENDING_QUEUE_KEY, timeout)
            .await?;

        match popped {
            None => Ok(None),
            Some(token) => match token.parse::<Uuid>() {
                Ok(job_id) => Ok(Some(job_id)),
                Err(_) => {
                    warn!(token = %token, "discarding malformed token from pending queue");
                    metrics::counter!("transcode_queue_malformed_tokens").increment(1);
                    Ok(None)
                }
            },
        }
    }

    /// Move a permanently failed job identifier onto the dead-letter list.
    /// Dead letters are never drained automatically.
    pub async fn push_dead_letter(&self, job_id: Uuid) -> CoordinationResult<()> {
        self.client
            .push_front(DEAD_LETTER_QUEUE_KEY, &job_id.to_string())
            .await
    }

    /// Observed pending-queue depth. Approximate under concurrent
    /// mutation; only used for metrics.
    pub async fn length(&self) -> CoordinationResult<u64> {
        self.client.list_length(PENDING_QUEUE_KEY).await
    }

    pub async fn dead_letter_length(&self) -> CoordinationResult<u64> {
        self.client.list_length(DEAD_LETTER_QUEUE_KEY).await
    }

    /// Snapshot of every identifier currently in the pending queue, for
    /// the sweeper's dispatch reconciliation.
    pub async fn pending_contents(&self) -> CoordinationResult<Vec<Uuid>> {
        let contents = self.client.list_contents(PENDING_QUEUE_KEY).await?;

        Ok(contents
            .iter()
            .filter_map(|token| token.parse().ok())
            .collect())
    }

    pub async fn dead_letter_contents(&self) -> CoordinationResult<Vec<Uuid>> {
        let contents = self.client.list_contents(DEAD_LETTER_QUEUE_KEY).await?;

        Ok(contents
            .iter()
            .filter_map(|token| token.parse().ok())
            .collect())
    }
}
