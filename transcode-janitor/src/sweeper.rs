//! Periodic reconciliation: re-enqueue stalled jobs and repair dispatch
//! failures. The sweeper is stateless and idempotent; a duplicate re-push
//! is absorbed by the lease registry and the claim predicate, so several
//! sweepers may run concurrently without harm.

use std::collections::HashSet;

use thiserror::Error;
use tracing::{info, warn};

use transcode_common::lease::LeaseRegistry;
use transcode_common::queue::WorkQueue;
use transcode_common::redis::CoordinationError;
use transcode_common::store::{JobStore, StoreError};

#[derive(Error, Debug)]
pub enum SweeperError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Coordination(#[from] CoordinationError),
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Stalled `processing` jobs re-pushed this sweep.
    pub stalled_requeued: u64,
    /// `queued` jobs that were missing from the pending list and were
    /// pushed again.
    pub dispatch_repaired: u64,
}

pub struct Sweeper {
    store: JobStore,
    queue: WorkQueue,
    leases: LeaseRegistry,
    stall_horizon: chrono::Duration,
}

impl Sweeper {
    pub fn new(
        store: JobStore,
        queue: WorkQueue,
        leases: LeaseRegistry,
        stall_horizon: chrono::Duration,
    ) -> Self {
        Self {
            store,
            queue,
            leases,
            stall_horizon,
        }
    }

    pub async fn run_once(&self) -> Result<SweepReport, SweeperError> {
        let report = SweepReport {
            stalled_requeued: self.requeue_stalled_jobs().await?,
            dispatch_repaired: self.reconcile_dispatch_failures().await?,
        };

        if report.stalled_requeued > 0 || report.dispatch_repaired > 0 {
            info!(
                stalled = report.stalled_requeued,
                repaired = report.dispatch_repaired,
                "sweep re-enqueued jobs"
            );
        }

        self.publish_queue_depths().await?;

        Ok(report)
    }

    /// Re-push `processing` jobs whose claim aged past the stall horizon.
    /// Ownership transfer itself happens in the claim predicate when a
    /// worker next dequeues the identifier.
    async fn requeue_stalled_jobs(&self) -> Result<u64, SweeperError> {
        let stalled = self.store.find_stalled_jobs(self.stall_horizon).await?;
        let mut requeued = 0;

        for job in stalled {
            warn!(job_id = %job.id, worker_id = ?job.worker_id, "re-enqueueing stalled job");
            self.queue.push(job.id).await?;
            requeued += 1;
        }

        metrics::counter!("transcode_sweeper_stalled_requeued").increment(requeued);
        Ok(requeued)
    }

    /// Close the gap left by a dispatcher whose queue push failed after
    /// the insert committed: any `queued` job that is neither in the
    /// pending list nor leased by a worker gets pushed again.
    async fn reconcile_dispatch_failures(&self) -> Result<u64, SweeperError> {
        let pending: HashSet<_> = self.queue.pending_contents().await?.into_iter().collect();
        let mut repaired = 0;

        for job_id in self.store.list_queued_job_ids().await? {
            if pending.contains(&job_id) {
                continue;
            }
            if self.leases.is_held(job_id).await? {
                continue;
            }
            warn!(job_id = %job_id, "re-enqueueing job missing from pending queue");
            self.queue.push(job_id).await?;
            repaired += 1;
        }

        metrics::counter!("transcode_sweeper_dispatch_repaired").increment(repaired);
        Ok(repaired)
    }

    async fn publish_queue_depths(&self) -> Result<(), SweeperError> {
        metrics::gauge!("transcode_queue_pending_depth").set(self.queue.length().await? as f64);
        metrics::gauge!("transcode_queue_dead_letter_depth")
            .set(self.queue.dead_letter_length().await? as f64);
        Ok(())
    }
}
