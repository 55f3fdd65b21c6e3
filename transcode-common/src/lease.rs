//! # LeaseRegistry
//!
//! Advisory, TTL-bounded ownership records in the coordination service,
//! layered above the database claim. The database remains the
//! authoritative arbiter of ownership; a lease only suppresses obviously
//! duplicate work when the same identifier reaches two healthy workers.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::redis::{Client, CoordinationResult};

/// Result of a guarded lease mutation. `NotOwner` and `NotFound` are
/// expected states, not errors: a lease can expire out from under a slow
/// worker without invalidating its database claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    Ok,
    NotOwner,
    NotFound,
}

fn lease_key(job_id: Uuid) -> String {
    format!("job:lock:{}", job_id)
}

#[derive(Clone)]
pub struct LeaseRegistry {
    client: Arc<dyn Client>,
}

impl LeaseRegistry {
    pub fn new(client: Arc<dyn Client>) -> Self {
        Self { client }
    }

    /// Attempt to take the lease on `job_id` for `worker_id`. Atomic
    /// set-if-absent with expiry; returns whether the lease was acquired.
    pub async fn acquire(
        &self,
        job_id: Uuid,
        worker_id: Uuid,
        ttl: Duration,
    ) -> CoordinationResult<bool> {
        self.client
            .set_if_absent(&lease_key(job_id), &worker_id.to_string(), ttl)
            .await
    }

    /// Refresh the lease expiry, iff `worker_id` still owns it. Evaluated
    /// as a single server-side script.
    pub async fn extend(
        &self,
        job_id: Uuid,
        worker_id: Uuid,
        ttl: Duration,
    ) -> CoordinationResult<LeaseOutcome> {
        self.client
            .compare_and_extend(&lease_key(job_id), &worker_id.to_string(), ttl)
            .await
    }

    /// Delete the lease, iff `worker_id` still owns it. Evaluated as a
    /// single server-side script.
    pub async fn release(
        &self,
        job_id: Uuid,
        worker_id: Uuid,
    ) -> CoordinationResult<LeaseOutcome> {
        self.client
            .compare_and_delete(&lease_key(job_id), &worker_id.to_string())
            .await
    }

    /// Whether any worker currently holds a lease on `job_id`. Used by the
    /// sweeper to avoid re-pushing identifiers that are being worked.
    pub async fn is_held(&self, job_id: Uuid) -> CoordinationResult<bool> {
        self.client.key_exists(&lease_key(job_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis::MockRedisClient;

    fn registry() -> LeaseRegistry {
        LeaseRegistry::new(Arc::new(MockRedisClient::new()))
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let leases = registry();
        let job_id = Uuid::new_v4();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let ttl = Duration::from_secs(300);

        assert!(leases.acquire(job_id, first, ttl).await.unwrap());
        assert!(!leases.acquire(job_id, second, ttl).await.unwrap());
        assert!(leases.is_held(job_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_extend_requires_ownership() {
        let leases = registry();
        let job_id = Uuid::new_v4();
        let owner = Uuid::new_v4();
        let other = Uuid::new_v4();
        let ttl = Duration::from_secs(300);

        leases.acquire(job_id, owner, ttl).await.unwrap();

        assert_eq!(
            leases.extend(job_id, owner, ttl).await.unwrap(),
            LeaseOutcome::Ok
        );
        assert_eq!(
            leases.extend(job_id, other, ttl).await.unwrap(),
            LeaseOutcome::NotOwner
        );
        assert_eq!(
            leases.extend(Uuid::new_v4(), owner, ttl).await.unwrap(),
            LeaseOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_release_frees_the_lease() {
        let leases = registry();
        let job_id = Uuid::new_v4();
        let owner = Uuid::new_v4();
        let other = Uuid::new_v4();
        let ttl = Duration::from_secs(300);

        leases.acquire(job_id, owner, ttl).await.unwrap();
        assert_eq!(
            leases.release(job_id, other).await.unwrap(),
            LeaseOutcome::NotOwner
        );
        assert_eq!(
            leases.release(job_id, owner).await.unwrap(),
            LeaseOutcome::Ok
        );
        assert!(!leases.is_held(job_id).await.unwrap());
        assert_eq!(
            leases.release(job_id, owner).await.unwrap(),
            LeaseOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_reacquired() {
        let leases = registry();
        let job_id = Uuid::new_v4();
        let crashed = Uuid::new_v4();
        let successor = Uuid::new_v4();

        leases
            .acquire(job_id, crashed, Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(!leases.is_held(job_id).await.unwrap());
        assert!(leases
            .acquire(job_id, successor, Duration::from_secs(300))
            .await
            .unwrap());
    }
}
