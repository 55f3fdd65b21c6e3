use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use transcode_common::health::HealthRegistry;
use transcode_common::job::{Job, JobStatus};
use transcode_common::lease::LeaseRegistry;
use transcode_common::queue::WorkQueue;
use transcode_common::redis::MockRedisClient;
use transcode_common::store::JobStore;
use transcode_worker::encoder::Transcoder;
use transcode_worker::storage::MockObjectStore;
use transcode_worker::worker::{TranscodeWorker, WorkerSettings};

pub struct Harness {
    pub worker: TranscodeWorker,
    pub worker_id: Uuid,
    pub store: JobStore,
    pub queue: WorkQueue,
    pub leases: LeaseRegistry,
    pub storage: MockObjectStore,
    pub shutdown: CancellationToken,
}

#[allow(dead_code)]
pub async fn harness(db: PgPool, encoder: Arc<dyn Transcoder>) -> Harness {
    harness_with_settings(db, encoder, WorkerSettings::default()).await
}

#[allow(dead_code)]
pub async fn harness_with_settings(
    db: PgPool,
    encoder: Arc<dyn Transcoder>,
    mut settings: WorkerSettings,
) -> Harness {
    let store = JobStore::new_from_pool(db);
    let redis = Arc::new(MockRedisClient::new());
    let queue = WorkQueue::new(redis.clone());
    let leases = LeaseRegistry::new(redis);
    let storage = MockObjectStore::new();
    let shutdown = CancellationToken::new();
    let worker_id = Uuid::new_v4();

    // Keep the loop responsive in tests.
    settings.queue_pop_timeout = Duration::from_millis(50);

    let registry = HealthRegistry::new("liveness");
    let liveness = registry
        .register("worker".to_string(), chrono::Duration::seconds(30))
        .await;

    let worker = TranscodeWorker::new(
        worker_id,
        store.clone(),
        queue.clone(),
        leases.clone(),
        Arc::new(storage.clone()),
        encoder,
        settings,
        liveness,
        shutdown.clone(),
    );

    Harness {
        worker,
        worker_id,
        store,
        queue,
        leases,
        storage,
        shutdown,
    }
}

/// Poll the store until the job reaches `status`, panicking after a few
/// seconds so a hung worker fails the test instead of wedging it.
#[allow(dead_code)]
pub async fn wait_for_status(store: &JobStore, job_id: Uuid, status: JobStatus) -> Job {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let job = store.get_job(job_id).await.expect("failed to get job");
        if job.status == status {
            return job;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "job {} never reached {:?}, last seen {:?}",
                job_id, status, job.status
            );
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Backdate a claim so it reads as stalled.
#[allow(dead_code)]
pub async fn age_claim(pool: &PgPool, job_id: Uuid, minutes: i32) {
    sqlx::query("UPDATE jobs SET started_at = NOW() - make_interval(mins => $2) WHERE id = $1")
        .bind(job_id)
        .bind(minutes)
        .execute(pool)
        .await
        .expect("failed to age claim");
}
