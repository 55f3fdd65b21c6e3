//! The per-job plan: everything that happens between a successful claim
//! and finalization. Output locators are deterministic, uploads overwrite
//! in place, and recording a locator twice is a no-op, so a job that is
//! executed more than once converges on the same set of outputs.

use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use transcode_common::job::Job;
use transcode_common::store::JobStore;

use crate::encoder::Transcoder;
use crate::error::{EncoderError, PlanError, StorageError};
use crate::storage::ObjectStore;

#[derive(Debug, Default)]
pub struct PlanReport {
    /// Renditions with an output locator recorded by the end of the plan.
    pub completed: usize,
    /// Per-rendition failures. These do not fail the job unless every
    /// rendition is in here.
    pub failures: Vec<RenditionFailure>,
}

#[derive(Debug)]
pub struct RenditionFailure {
    pub resolution: String,
    pub error: String,
}

/// File name of the source object, without any prefix directories.
fn source_basename(input_key: &str) -> &str {
    input_key.rsplit('/').next().unwrap_or(input_key)
}

/// Source file extension, defaulting to mp4 when the key has none.
fn source_extension(input_key: &str) -> &str {
    let basename = source_basename(input_key);
    match basename.rsplit_once('.') {
        Some((stem, extension)) if !stem.is_empty() && !extension.is_empty() => extension,
        _ => "mp4",
    }
}

fn source_stem(input_key: &str) -> &str {
    let basename = source_basename(input_key);
    match basename.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => basename,
    }
}

/// Deterministic output locator for one rendition of a job. Determinism
/// is what makes reprocessing idempotent: every attempt of the same job
/// writes the same keys.
pub fn output_key(job_id: Uuid, input_key: &str, resolution: &str) -> String {
    format!(
        "outputs/{}/{}_{}.mp4",
        job_id,
        source_stem(input_key),
        resolution
    )
}

pub async fn execute(
    store: &JobStore,
    storage: &dyn ObjectStore,
    encoder: &dyn Transcoder,
    job: &Job,
    scratch_root: &Path,
    cancel: &CancellationToken,
) -> Result<PlanReport, PlanError> {
    // The scratch area is removed on drop, on every exit path.
    let scratch = tempfile::Builder::new()
        .prefix("transcode-")
        .tempdir_in(scratch_root)
        .map_err(PlanError::Scratch)?;

    let input_path = scratch
        .path()
        .join(format!("source.{}", source_extension(&job.input_key)));

    storage
        .download(&job.input_key, &input_path, cancel)
        .await
        .map_err(|source| match source {
            StorageError::Cancelled => PlanError::Cancelled,
            source => PlanError::Download {
                key: job.input_key.clone(),
                source,
            },
        })?;

    let renditions = store.list_renditions(job.id).await?;
    let mut report = PlanReport::default();

    for rendition in &renditions {
        if cancel.is_cancelled() {
            return Err(PlanError::Cancelled);
        }

        let output_key = output_key(job.id, &job.input_key, &rendition.resolution);

        // An output left behind by an earlier attempt of this job counts
        // as produced; the locator is deterministic so the check is exact.
        match storage.exists(&output_key).await {
            Ok(true) => {
                store.complete_rendition(rendition.id, &output_key).await?;
                report.completed += 1;
                continue;
            }
            Ok(false) => {}
            Err(error) => {
                // Re-transcoding overwrites the same locator, so a failed
                // existence check costs work but not correctness.
                warn!(job_id = %job.id, output_key = %output_key, "existence check failed: {}", error);
            }
        }

        let output_path = scratch
            .path()
            .join(format!("out_{}.mp4", rendition.resolution));

        if let Err(error) = encoder
            .transcode(&input_path, &output_path, &rendition.resolution, cancel)
            .await
        {
            if matches!(error, EncoderError::Cancelled) {
                return Err(PlanError::Cancelled);
            }
            warn!(
                job_id = %job.id,
                resolution = %rendition.resolution,
                "rendition transcode failed: {}",
                error
            );
            report.failures.push(RenditionFailure {
                resolution: rendition.resolution.clone(),
                error: error.to_string(),
            });
            continue;
        }

        if let Err(error) = storage.upload(&output_path, &output_key, cancel).await {
            if matches!(error, StorageError::Cancelled) {
                return Err(PlanError::Cancelled);
            }
            warn!(
                job_id = %job.id,
                resolution = %rendition.resolution,
                "rendition upload failed: {}",
                error
            );
            report.failures.push(RenditionFailure {
                resolution: rendition.resolution.clone(),
                error: error.to_string(),
            });
            continue;
        }

        if let Err(error) = store.complete_rendition(rendition.id, &output_key).await {
            report.failures.push(RenditionFailure {
                resolution: rendition.resolution.clone(),
                error: error.to_string(),
            });
            continue;
        }

        report.completed += 1;
    }

    if report.completed == 0 {
        let summary = report
            .failures
            .iter()
            .map(|failure| format!("{}: {}", failure.resolution, failure.error))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(PlanError::AllRenditionsFailed(summary));
    }

    Ok(report)
}
