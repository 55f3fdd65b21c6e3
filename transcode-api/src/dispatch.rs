use tracing::error;
use uuid::Uuid;

use transcode_common::queue::WorkQueue;

/// Moves a freshly persisted job identifier into the pending queue,
/// exactly once per successful insert.
#[derive(Clone)]
pub struct Dispatcher {
    queue: WorkQueue,
}

impl Dispatcher {
    pub fn new(queue: WorkQueue) -> Self {
        Self { queue }
    }

    /// Best-effort enqueue, called after the job row has committed. A
    /// queue failure is logged but never reverses the insert: the row is
    /// `queued` and absent from the pending list, which is exactly the
    /// state the janitor's dispatch reconciliation repairs.
    pub async fn dispatch(&self, job_id: Uuid) {
        match self.queue.push(job_id).await {
            Ok(()) => {
                metrics::counter!("transcode_jobs_dispatched").increment(1);
            }
            Err(err) => {
                error!(job_id = %job_id, "failed to enqueue job, leaving for sweeper: {}", err);
                metrics::counter!("transcode_dispatch_failures").increment(1);
            }
        }
    }
}
