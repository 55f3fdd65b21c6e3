//! The worker runtime: claim, execute, and terminally resolve one job at
//! a time. Concurrency across jobs comes from running more worker
//! processes, not from parallelism inside one.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use transcode_common::health::HealthHandle;
use transcode_common::job::Job;
use transcode_common::lease::{LeaseOutcome, LeaseRegistry};
use transcode_common::queue::WorkQueue;
use transcode_common::retry::BackoffSchedule;
use transcode_common::store::{JobOutcome, JobStore, StoreError};

use crate::encoder::Transcoder;
use crate::error::PlanError;
use crate::plan;
use crate::storage::ObjectStore;

#[derive(Clone)]
pub struct WorkerSettings {
    /// Age after which another worker may steal a `processing` claim.
    pub stall_horizon: chrono::Duration,
    pub lease_ttl: Duration,
    pub lease_renew_interval: Duration,
    pub queue_pop_timeout: Duration,
    pub backoff: BackoffSchedule,
    pub scratch_root: PathBuf,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            stall_horizon: chrono::Duration::minutes(10),
            lease_ttl: Duration::from_secs(300),
            lease_renew_interval: Duration::from_secs(120),
            queue_pop_timeout: Duration::from_secs(5),
            backoff: BackoffSchedule::default(),
            scratch_root: std::env::temp_dir(),
        }
    }
}

pub struct TranscodeWorker {
    /// Stable identity of this process, proving lease ownership.
    worker_id: Uuid,
    store: JobStore,
    queue: WorkQueue,
    leases: LeaseRegistry,
    storage: Arc<dyn ObjectStore>,
    encoder: Arc<dyn Transcoder>,
    settings: WorkerSettings,
    liveness: HealthHandle,
    shutdown: CancellationToken,
}

impl TranscodeWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: Uuid,
        store: JobStore,
        queue: WorkQueue,
        leases: LeaseRegistry,
        storage: Arc<dyn ObjectStore>,
        encoder: Arc<dyn Transcoder>,
        settings: WorkerSettings,
        liveness: HealthHandle,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            worker_id,
            store,
            queue,
            leases,
            storage,
            encoder,
            settings,
            liveness,
            shutdown,
        }
    }

    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    /// Run until the shutdown signal fires, then drain: the job in flight
    /// aborts at its next suspension point (or finishes), the lease is
    /// released, and the loop exits.
    pub async fn run(&self) {
        info!(worker_id = %self.worker_id, "worker loop starting");

        loop {
            self.liveness.report_healthy().await;

            let popped = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                popped = self.queue.blocking_pop(self.settings.queue_pop_timeout) => popped,
            };

            let job_id = match popped {
                Ok(Some(job_id)) => job_id,
                Ok(None) => continue,
                Err(err) => {
                    error!("failed to pop from pending queue: {}", err);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            self.process_token(job_id).await;
        }

        info!(worker_id = %self.worker_id, "worker loop drained");
    }

    /// Handle one identifier popped from the pending queue: lease, claim,
    /// execute, resolve. Never panics and never returns an error; every
    /// failure mode either re-queues through the retry policy or leaves
    /// the row for the sweeper.
    pub async fn process_token(&self, job_id: Uuid) {
        metrics::counter!("transcode_jobs_popped").increment(1);

        match self
            .leases
            .acquire(job_id, self.worker_id, self.settings.lease_ttl)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                // Another worker already holds this identifier.
                metrics::counter!("transcode_jobs_lease_busy").increment(1);
                return;
            }
            Err(err) => {
                error!(job_id = %job_id, "failed to acquire lease: {}", err);
                return;
            }
        }

        let job = match self
            .store
            .claim_job(job_id, self.worker_id, self.settings.stall_horizon)
            .await
        {
            Ok(job) => job,
            Err(StoreError::AlreadyClaimed(_)) => {
                // Lost the database race, the job is terminal, or the
                // token is an orphan with no backing row; all three are
                // discarded without retry.
                match self.store.get_job(job_id).await {
                    Err(StoreError::NotFound(_)) => {
                        warn!(job_id = %job_id, "discarding token with no backing job row");
                        metrics::counter!("transcode_jobs_orphan_tokens").increment(1);
                    }
                    _ => {
                        metrics::counter!("transcode_jobs_claim_lost").increment(1);
                    }
                }
                self.release_lease(job_id).await;
                return;
            }
            Err(err) => {
                error!(job_id = %job_id, "failed to claim job: {}", err);
                self.release_lease(job_id).await;
                return;
            }
        };

        info!(job_id = %job_id, worker_id = %self.worker_id, attempt = job.retry_count + 1, "claimed job");
        metrics::counter!("transcode_jobs_claimed").increment(1);

        // Renewal companion: keeps the lease alive for as long as the plan
        // runs. Renewal failures are logged but never abort the job; the
        // database claim is the authoritative ownership record.
        let renewal_stop = CancellationToken::new();
        let renewal = tokio::spawn(renew_lease(
            self.leases.clone(),
            job_id,
            self.worker_id,
            self.settings.lease_ttl,
            self.settings.lease_renew_interval,
            renewal_stop.clone(),
        ));

        let started = tokio::time::Instant::now();
        let outcome = plan::execute(
            &self.store,
            self.storage.as_ref(),
            self.encoder.as_ref(),
            &job,
            &self.settings.scratch_root,
            &self.shutdown,
        )
        .await;

        renewal_stop.cancel();
        drop(renewal.await);

        match outcome {
            Ok(report) => {
                let elapsed = started.elapsed().as_secs_f64();
                if !report.failures.is_empty() {
                    warn!(
                        job_id = %job_id,
                        completed = report.completed,
                        failed = report.failures.len(),
                        "job finished with partial rendition failures"
                    );
                }
                match self
                    .store
                    .finalize_job(job_id, JobOutcome::Completed, None)
                    .await
                {
                    Ok(_) => {
                        info!(job_id = %job_id, completed = report.completed, "job completed");
                        metrics::counter!("transcode_jobs_completed").increment(1);
                        metrics::histogram!("transcode_job_processing_duration_seconds")
                            .record(elapsed);
                    }
                    Err(err) => {
                        error!(job_id = %job_id, "failed to finalize completed job: {}", err)
                    }
                }
            }
            Err(PlanError::Cancelled) => {
                // Shutdown mid-job: the row stays `processing` and will be
                // swept past the stall horizon. No retry is consumed.
                info!(job_id = %job_id, "job aborted by shutdown, leaving for sweeper");
                metrics::counter!("transcode_jobs_aborted").increment(1);
            }
            Err(err) => self.handle_plan_failure(&job, err).await,
        }

        self.release_lease(job_id).await;
    }

    async fn handle_plan_failure(&self, job: &Job, err: PlanError) {
        warn!(job_id = %job.id, worker_id = %self.worker_id, "job plan failed: {}", err);
        metrics::counter!("transcode_jobs_plan_failed").increment(1);

        if !job.has_retries_remaining() {
            self.dead_letter(job.id, &err).await;
            return;
        }

        match self.store.increment_retry(job.id).await {
            Ok(requeued) => {
                let delay = self
                    .settings
                    .backoff
                    .delay_for_retry(requeued.retry_count as u32);
                info!(
                    job_id = %job.id,
                    retry_count = requeued.retry_count,
                    delay_secs = delay.as_secs(),
                    "scheduling retry"
                );
                metrics::counter!("transcode_jobs_retried").increment(1);

                // Deferred re-enqueue. If the process dies before the
                // timer fires, the row is `queued` but absent from the
                // pending list, and the sweeper re-pushes it.
                let queue = self.queue.clone();
                let job_id = job.id;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(err) = queue.push(job_id).await {
                        error!(job_id = %job_id, "failed to re-enqueue for retry: {}", err);
                    }
                });
            }
            Err(StoreError::RetriesExhausted(_)) => {
                // The in-database budget guard refused the increment.
                self.dead_letter(job.id, &err).await;
            }
            Err(store_err) => {
                // Leave the row `processing`; the sweeper re-queues it.
                error!(job_id = %job.id, "failed to increment retry: {}", store_err);
            }
        }
    }

    async fn dead_letter(&self, job_id: Uuid, err: &PlanError) {
        if let Err(push_err) = self.queue.push_dead_letter(job_id).await {
            error!(job_id = %job_id, "failed to push dead letter: {}", push_err);
        }

        let message = format!("exceeded max retries: {}", err);
        match self
            .store
            .finalize_job(job_id, JobOutcome::Failed, Some(&message))
            .await
        {
            Ok(_) => {
                warn!(job_id = %job_id, "job dead-lettered");
                metrics::counter!("transcode_jobs_dead_lettered").increment(1);
            }
            Err(store_err) => {
                error!(job_id = %job_id, "failed to finalize failed job: {}", store_err)
            }
        }
    }

    async fn release_lease(&self, job_id: Uuid) {
        match self.leases.release(job_id, self.worker_id).await {
            Ok(LeaseOutcome::Ok) => {}
            Ok(outcome) => {
                // Expired or taken over; nothing to release.
                warn!(job_id = %job_id, "lease release returned {:?}", outcome);
            }
            Err(err) => {
                // The lease will expire on its own TTL.
                warn!(job_id = %job_id, "failed to release lease: {}", err);
            }
        }
    }
}

async fn renew_lease(
    leases: LeaseRegistry,
    job_id: Uuid,
    worker_id: Uuid,
    ttl: Duration,
    every: Duration,
    stop: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    // The first tick fires immediately; the lease was just acquired.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = interval.tick() => {}
        }

        match leases.extend(job_id, worker_id, ttl).await {
            Ok(LeaseOutcome::Ok) => {}
            Ok(outcome) => {
                warn!(job_id = %job_id, "lease renewal returned {:?}", outcome);
                metrics::counter!("transcode_lease_renewal_failures").increment(1);
            }
            Err(err) => {
                warn!(job_id = %job_id, "lease renewal failed: {}", err);
                metrics::counter!("transcode_lease_renewal_failures").increment(1);
            }
        }
    }
}
