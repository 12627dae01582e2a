//! Persistence for review jobs and distributed locks.
//!
//! Two backends implement the traits here: `SqliteStore` for deployments and
//! `InMemoryStore` for tests and single-process development.

mod memory;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use revhook_core::{JobId, JobStatus, NewJob, ReviewJob};

use crate::error::StoreError;

/// Result of an idempotent job insert.
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    Created(ReviewJob),
    /// A job for the same `(project, commit)` is already pending, running, or done.
    Duplicate(ReviewJob),
}

impl CreateOutcome {
    pub fn job(&self) -> &ReviewJob {
        match self {
            Self::Created(job) | Self::Duplicate(job) => job,
        }
    }
}

/// Persistent record of review jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert `new` at `pending` unless a job for the same project and commit
    /// already exists with a status other than `failed`.
    ///
    /// The check and the insert are atomic. An empty commit hash is never
    /// treated as a duplicate.
    async fn create_unless_active(&self, new: NewJob) -> Result<CreateOutcome, StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<ReviewJob>, StoreError>;

    /// Persist every mutable field of `job`.
    async fn update(&self, job: &ReviewJob) -> Result<(), StoreError>;

    /// Most recent job for a commit.
    async fn find_by_commit(
        &self,
        project_id: i64,
        commit_hash: &str,
    ) -> Result<Option<ReviewJob>, StoreError>;

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<ReviewJob>, StoreError>;

    /// Failed jobs still under the attempt cap, oldest first.
    ///
    /// A failed job superseded by a newer job for the same commit is left
    /// out; the newer job owns that commit now.
    async fn list_retryable(
        &self,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<ReviewJob>, StoreError>;

    /// Pending or analyzing jobs last updated before `cutoff`, oldest first.
    async fn list_stale(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ReviewJob>, StoreError>;
}

/// A named lease shared by every process pointing at the same store.
///
/// A lease is acquirable when nobody holds it, when it has expired, or when
/// `owner` already holds it (which extends it).
#[async_trait]
pub trait DistributedLock: Send + Sync {
    async fn try_acquire(
        &self,
        name: &str,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Drop the lease if `owner` still holds it. Returns whether it did.
    async fn release(&self, name: &str, key: &str, owner: &str) -> Result<bool, StoreError>;
}
