//! Commit-level duplicate suppression.
//!
//! Platforms redeliver a webhook when our acknowledgement is slow, and the
//! same commit shows up again when it is fast-forwarded onto another branch.
//! Either way the `(project, commit)` pair already has a job, and the new
//! delivery must not produce a second one.

use std::sync::Arc;

use revhook_core::{JobId, NewJob, ReviewJob};
use tracing::info;

use crate::error::StoreError;
use crate::store::{CreateOutcome, JobStore};

/// What the guard decided for one delivery.
#[derive(Debug, Clone)]
pub enum Admission {
    /// A new job was created and should be queued.
    Fresh(ReviewJob),
    /// An existing job already covers this commit. Acknowledge, do not queue.
    Duplicate(JobId),
}

#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn JobStore>,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Create the job unless a non-failed job exists for the same key.
    ///
    /// The check and the insert happen atomically in the store, so two
    /// concurrent deliveries of one commit yield exactly one `Fresh`.
    pub async fn admit(&self, new: NewJob) -> Result<Admission, StoreError> {
        match self.store.create_unless_active(new).await? {
            CreateOutcome::Created(job) => Ok(Admission::Fresh(job)),
            CreateOutcome::Duplicate(existing) => {
                info!(
                    job_id = %existing.id,
                    project_id = existing.project_id,
                    commit = %existing.short_commit(),
                    status = %existing.status,
                    "Duplicate delivery, existing job covers this commit"
                );
                Ok(Admission::Duplicate(existing.id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract::new_job;
    use crate::store::InMemoryStore;
    use revhook_core::JobStatus;

    #[tokio::test]
    async fn test_second_delivery_is_duplicate() {
        let store = Arc::new(InMemoryStore::new());
        let guard = IdempotencyGuard::new(store.clone());

        let Admission::Fresh(first) = guard.admit(new_job(1, "abc123")).await.unwrap() else {
            panic!("first delivery should be fresh");
        };
        let Admission::Duplicate(id) = guard.admit(new_job(1, "abc123")).await.unwrap() else {
            panic!("second delivery should be a duplicate");
        };
        assert_eq!(id, first.id);
        assert_eq!(
            store.list_by_status(JobStatus::Pending, 10).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_same_commit_other_project_is_fresh() {
        let guard = IdempotencyGuard::new(Arc::new(InMemoryStore::new()));
        guard.admit(new_job(1, "abc123")).await.unwrap();
        assert!(matches!(
            guard.admit(new_job(2, "abc123")).await.unwrap(),
            Admission::Fresh(_)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_deliveries_yield_one_job() {
        let guard = IdempotencyGuard::new(Arc::new(InMemoryStore::new()));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let guard = guard.clone();
            handles.push(tokio::spawn(async move {
                guard.admit(new_job(5, "feedface")).await.unwrap()
            }));
        }
        let mut fresh = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), Admission::Fresh(_)) {
                fresh += 1;
            }
        }
        assert_eq!(fresh, 1);
    }
}
