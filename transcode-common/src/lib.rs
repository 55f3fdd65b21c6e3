//! Shared core of the transcoding pipeline: the job data model, the
//! Postgres-backed job store, and the Redis-backed work queue and lease
//! registry that hand jobs to workers.

pub mod health;
pub mod job;
pub mod lease;
pub mod metrics;
pub mod queue;
pub mod redis;
pub mod retry;
pub mod shutdown;
pub mod store;
