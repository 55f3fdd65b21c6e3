use thiserror::Error;

use transcode_common::store::StoreError;

/// Enumeration of errors produced by the external encoder invocation.
#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("unknown transcode profile: {0}")]
    UnknownProfile(String),
    #[error("encoder process error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoder exited with status {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
    #[error("transcode was cancelled")]
    Cancelled,
}

/// Enumeration of errors produced by object-store transfers.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("{command} failed for {key}: {message}")]
    OperationFailed {
        command: String,
        key: String,
        message: String,
    },
    #[error("local file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transfer was cancelled")]
    Cancelled,
}

/// Errors that fail a whole per-job plan. Individual rendition failures
/// are recorded in the plan report instead and do not abort the job.
#[derive(Error, Debug)]
pub enum PlanError {
    #[error("failed to allocate scratch area: {0}")]
    Scratch(std::io::Error),
    #[error("failed to download {key}: {source}")]
    Download { key: String, source: StorageError },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("all renditions failed: {0}")]
    AllRenditionsFailed(String),
    #[error("plan was cancelled by shutdown")]
    Cancelled,
}
