use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use uuid::Uuid;

use transcode_common::job::JobStatus;
use transcode_common::retry::BackoffSchedule;
use transcode_worker::encoder::MockTranscoder;
use transcode_worker::plan::output_key;
use transcode_worker::worker::WorkerSettings;

mod common;
use common::{age_claim, harness, harness_with_settings, wait_for_status, Harness};

fn resolutions(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

async fn submit(
    harness: &Harness,
    input_key: &str,
    resolutions: &[String],
    max_retries: i32,
) -> Uuid {
    let job = harness
        .store
        .create_job(input_key, resolutions, max_retries)
        .await
        .expect("failed to create job");
    job.id
}

#[sqlx::test(migrations = "../migrations")]
async fn happy_path_produces_all_renditions(db: PgPool) {
    let encoder = Arc::new(MockTranscoder::new());
    let harness = harness(db, encoder).await;
    harness.storage.put("uploads/a/v.mp4", b"source video");

    let job_id = submit(
        &harness,
        "uploads/a/v.mp4",
        &resolutions(&["480p", "720p", "1080p"]),
        3,
    )
    .await;
    harness.queue.push(job_id).await.unwrap();

    let worker = harness.worker;
    let loop_handle = tokio::spawn(async move { worker.run().await });

    let job = wait_for_status(&harness.store, job_id, JobStatus::Completed).await;
    harness.shutdown.cancel();
    loop_handle.await.unwrap();

    assert!(job.error_message.is_none());
    assert_eq!(job.retry_count, 0);

    let renditions = harness.store.list_renditions(job_id).await.unwrap();
    assert_eq!(renditions.len(), 3);
    for rendition in &renditions {
        let expected = output_key(job_id, "uploads/a/v.mp4", &rendition.resolution);
        assert_eq!(rendition.output_key.as_deref(), Some(expected.as_str()));
        assert!(harness.storage.get(&expected).is_some());
    }

    assert_eq!(harness.queue.dead_letter_length().await.unwrap(), 0);
    assert!(!harness.leases.is_held(job_id).await.unwrap());
}

#[sqlx::test(migrations = "../migrations")]
async fn stalled_claim_is_stolen_and_completed(db: PgPool) {
    let encoder = Arc::new(MockTranscoder::new());
    let harness = harness(db.clone(), encoder).await;
    harness.storage.put("uploads/a/v.mp4", b"source video");

    let job_id = submit(&harness, "uploads/a/v.mp4", &resolutions(&["480p"]), 3).await;

    // A previous worker claimed the job and crashed mid-plan; its claim
    // has aged past the stall horizon and its lease has expired.
    let crashed_worker = Uuid::new_v4();
    harness
        .store
        .claim_job(job_id, crashed_worker, chrono::Duration::minutes(10))
        .await
        .unwrap();
    age_claim(&db, job_id, 11).await;

    harness.worker.process_token(job_id).await;

    let job = harness.store.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    // A crash is not a plan failure; no retry was consumed.
    assert_eq!(job.retry_count, 0);

    let renditions = harness.store.list_renditions(job_id).await.unwrap();
    assert_eq!(
        renditions[0].output_key.as_deref(),
        Some(output_key(job_id, "uploads/a/v.mp4", "480p").as_str())
    );
}

#[sqlx::test(migrations = "../migrations")]
async fn partial_rendition_failure_still_completes(db: PgPool) {
    let encoder = Arc::new(MockTranscoder::failing_on(&["720p"]));
    let harness = harness(db, encoder).await;
    harness.storage.put("uploads/a/v.mp4", b"source video");

    let job_id = submit(
        &harness,
        "uploads/a/v.mp4",
        &resolutions(&["480p", "720p", "1080p"]),
        3,
    )
    .await;

    harness.worker.process_token(job_id).await;

    let job = harness.store.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    let renditions = harness.store.list_renditions(job_id).await.unwrap();
    let by_resolution = |resolution: &str| {
        renditions
            .iter()
            .find(|r| r.resolution == resolution)
            .unwrap()
            .output_key
            .clone()
    };
    assert!(by_resolution("480p").is_some());
    assert!(by_resolution("720p").is_none());
    assert!(by_resolution("1080p").is_some());

    assert_eq!(harness.queue.dead_letter_length().await.unwrap(), 0);
}

#[sqlx::test(migrations = "../migrations")]
async fn exhausted_retries_dead_letter_the_job(db: PgPool) {
    let encoder = Arc::new(MockTranscoder::failing_always());
    let settings = WorkerSettings {
        // No waiting between attempts; the test drives the full machine.
        backoff: BackoffSchedule::new(vec![Duration::ZERO, Duration::ZERO]),
        ..WorkerSettings::default()
    };
    let harness = harness_with_settings(db, encoder.clone(), settings).await;
    harness.storage.put("uploads/a/v.mp4", b"source video");

    let job_id = submit(&harness, "uploads/a/v.mp4", &resolutions(&["480p"]), 2).await;
    harness.queue.push(job_id).await.unwrap();

    let worker = harness.worker;
    let loop_handle = tokio::spawn(async move { worker.run().await });

    let job = wait_for_status(&harness.store, job_id, JobStatus::Failed).await;
    harness.shutdown.cancel();
    loop_handle.await.unwrap();

    // Initial attempt plus two retries.
    assert_eq!(encoder.invocations().len(), 3);
    assert_eq!(job.retry_count, 2);
    assert!(job
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("exceeded max retries"));

    assert_eq!(
        harness.queue.dead_letter_contents().await.unwrap(),
        vec![job_id]
    );
    assert!(!harness.leases.is_held(job_id).await.unwrap());
}

#[sqlx::test(migrations = "../migrations")]
async fn busy_lease_discards_the_token(db: PgPool) {
    let encoder = Arc::new(MockTranscoder::new());
    let harness = harness(db, encoder.clone()).await;
    harness.storage.put("uploads/a/v.mp4", b"source video");

    let job_id = submit(&harness, "uploads/a/v.mp4", &resolutions(&["480p"]), 3).await;

    // Another worker already leased this identifier.
    let other_worker = Uuid::new_v4();
    assert!(harness
        .leases
        .acquire(job_id, other_worker, Duration::from_secs(300))
        .await
        .unwrap());

    harness.worker.process_token(job_id).await;

    // The token was dropped without touching the job or the lease.
    let job = harness.store.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert!(encoder.invocations().is_empty());
    assert!(harness.leases.is_held(job_id).await.unwrap());
}

#[sqlx::test(migrations = "../migrations")]
async fn lost_claim_race_releases_the_lease(db: PgPool) {
    let encoder = Arc::new(MockTranscoder::new());
    let harness = harness(db, encoder.clone()).await;
    harness.storage.put("uploads/a/v.mp4", b"source video");

    let job_id = submit(&harness, "uploads/a/v.mp4", &resolutions(&["480p"]), 3).await;

    // A second worker wins the database claim between our pop and claim.
    let other_worker = Uuid::new_v4();
    harness
        .store
        .claim_job(job_id, other_worker, chrono::Duration::minutes(10))
        .await
        .unwrap();

    harness.worker.process_token(job_id).await;

    let job = harness.store.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.worker_id, Some(other_worker));
    assert!(encoder.invocations().is_empty());
    assert!(!harness.leases.is_held(job_id).await.unwrap());
}

#[sqlx::test(migrations = "../migrations")]
async fn expired_lease_does_not_block_completion(db: PgPool) {
    // Renewal never fires (the interval far exceeds the encode), so the
    // lease expires mid-plan. The database claim is authoritative and the
    // job still completes.
    let encoder = Arc::new(MockTranscoder::new().with_delay(Duration::from_millis(100)));
    let settings = WorkerSettings {
        lease_ttl: Duration::from_millis(20),
        ..WorkerSettings::default()
    };
    let harness = harness_with_settings(db, encoder, settings).await;
    harness.storage.put("uploads/a/v.mp4", b"source video");

    let job_id = submit(&harness, "uploads/a/v.mp4", &resolutions(&["480p"]), 3).await;

    harness.worker.process_token(job_id).await;

    let job = harness.store.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}

#[sqlx::test(migrations = "../migrations")]
async fn orphan_token_is_discarded(db: PgPool) {
    let encoder = Arc::new(MockTranscoder::new());
    let harness = harness(db, encoder.clone()).await;

    let orphan = Uuid::new_v4();
    harness.worker.process_token(orphan).await;

    assert!(encoder.invocations().is_empty());
    assert!(!harness.leases.is_held(orphan).await.unwrap());
    assert_eq!(harness.queue.length().await.unwrap(), 0);
    assert_eq!(harness.queue.dead_letter_length().await.unwrap(), 0);
}

#[sqlx::test(migrations = "../migrations")]
async fn existing_outputs_short_circuit_reprocessing(db: PgPool) {
    let encoder = Arc::new(MockTranscoder::new());
    let harness = harness(db, encoder.clone()).await;
    harness.storage.put("uploads/a/v.mp4", b"source video");

    let job_id = submit(
        &harness,
        "uploads/a/v.mp4",
        &resolutions(&["480p", "720p"]),
        3,
    )
    .await;

    // Outputs from an earlier attempt are already in the object store.
    for resolution in ["480p", "720p"] {
        harness.storage.put(
            &output_key(job_id, "uploads/a/v.mp4", resolution),
            b"already transcoded",
        );
    }

    harness.worker.process_token(job_id).await;

    let job = harness.store.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    // Nothing was re-encoded.
    assert!(encoder.invocations().is_empty());

    let renditions = harness.store.list_renditions(job_id).await.unwrap();
    for rendition in &renditions {
        let expected = output_key(job_id, "uploads/a/v.mp4", &rendition.resolution);
        assert_eq!(rendition.output_key.as_deref(), Some(expected.as_str()));
    }
}

#[sqlx::test(migrations = "../migrations")]
async fn shutdown_mid_plan_leaves_job_for_sweeper(db: PgPool) {
    let encoder = Arc::new(MockTranscoder::new().with_delay(Duration::from_secs(30)));
    let harness = harness(db, encoder).await;
    harness.storage.put("uploads/a/v.mp4", b"source video");

    let job_id = submit(&harness, "uploads/a/v.mp4", &resolutions(&["480p"]), 3).await;

    let worker = Arc::new(harness.worker);
    let processing = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.process_token(job_id).await })
    };

    // Give the worker time to claim and enter the encode, then interrupt.
    tokio::time::sleep(Duration::from_millis(100)).await;
    harness.shutdown.cancel();
    processing.await.unwrap();

    // The job is left `processing` for the sweeper; no retry consumed,
    // no terminal state, lease released.
    let job = harness.store.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.retry_count, 0);
    assert!(job.error_message.is_none());
    assert!(!harness.leases.is_held(job_id).await.unwrap());
}
