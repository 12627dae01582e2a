//! In-memory implementation of `JobStore` and `DistributedLock`.
//!
//! All state is lost on restart. Locks are only shared within the process.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use revhook_core::{JobId, JobStatus, NewJob, ReviewJob};
use tokio::sync::RwLock;

use super::{CreateOutcome, DistributedLock, JobStore};
use crate::error::StoreError;

#[derive(Debug, Clone)]
struct LockRecord {
    owner: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Jobs {
    next_id: i64,
    rows: HashMap<JobId, ReviewJob>,
}

impl Jobs {
    fn latest_for(&self, project_id: i64, commit_hash: &str) -> Option<&ReviewJob> {
        self.rows
            .values()
            .filter(|j| j.project_id == project_id && j.commit_hash == commit_hash)
            .max_by_key(|j| j.id)
    }

    fn is_superseded(&self, job: &ReviewJob) -> bool {
        if job.commit_hash.is_empty() {
            return false;
        }
        self.latest_for(job.project_id, &job.commit_hash)
            .is_some_and(|latest| latest.id != job.id)
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    jobs: RwLock<Jobs>,
    locks: RwLock<HashMap<(String, String), LockRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn oldest_first(jobs: &mut [ReviewJob]) {
    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn create_unless_active(&self, new: NewJob) -> Result<CreateOutcome, StoreError> {
        let mut jobs = self.jobs.write().await;

        if !new.commit_hash.is_empty() {
            let active = jobs
                .rows
                .values()
                .filter(|j| {
                    j.project_id == new.project_id
                        && j.commit_hash == new.commit_hash
                        && j.status != JobStatus::Failed
                })
                .max_by_key(|j| j.id);
            if let Some(existing) = active {
                return Ok(CreateOutcome::Duplicate(existing.clone()));
            }
        }

        jobs.next_id += 1;
        let id = JobId(jobs.next_id);
        let job = ReviewJob::from_new(id, new, Utc::now());
        jobs.rows.insert(id, job.clone());
        Ok(CreateOutcome::Created(job))
    }

    async fn get(&self, id: JobId) -> Result<Option<ReviewJob>, StoreError> {
        Ok(self.jobs.read().await.rows.get(&id).cloned())
    }

    async fn update(&self, job: &ReviewJob) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        match jobs.rows.get_mut(&job.id) {
            Some(row) => {
                *row = job.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(job.id.0)),
        }
    }

    async fn find_by_commit(
        &self,
        project_id: i64,
        commit_hash: &str,
    ) -> Result<Option<ReviewJob>, StoreError> {
        let jobs = self.jobs.read().await;
        Ok(jobs.latest_for(project_id, commit_hash).cloned())
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<ReviewJob>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut matching: Vec<ReviewJob> = jobs
            .rows
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        oldest_first(&mut matching);
        matching.truncate(limit);
        Ok(matching)
    }

    async fn list_retryable(
        &self,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<ReviewJob>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut matching: Vec<ReviewJob> = jobs
            .rows
            .values()
            .filter(|j| j.is_retryable(max_attempts) && !jobs.is_superseded(j))
            .cloned()
            .collect();
        oldest_first(&mut matching);
        matching.truncate(limit);
        Ok(matching)
    }

    async fn list_stale(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ReviewJob>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut matching: Vec<ReviewJob> = jobs
            .rows
            .values()
            .filter(|j| !j.status.is_terminal() && j.updated_at < cutoff)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));
        matching.truncate(limit);
        Ok(matching)
    }
}

#[async_trait]
impl DistributedLock for InMemoryStore {
    async fn try_acquire(
        &self,
        name: &str,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        use std::collections::hash_map::Entry;

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StoreError::storage("lock ttl", e))?;
        let record = LockRecord {
            owner: owner.to_string(),
            expires_at: now + ttl,
        };

        let mut locks = self.locks.write().await;
        match locks.entry((name.to_string(), key.to_string())) {
            Entry::Occupied(mut entry) => {
                let held = entry.get();
                if held.owner == owner || held.expires_at < now {
                    entry.insert(record);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(record);
                Ok(true)
            }
        }
    }

    async fn release(&self, name: &str, key: &str, owner: &str) -> Result<bool, StoreError> {
        let mut locks = self.locks.write().await;
        let lock_id = (name.to_string(), key.to_string());
        if locks.get(&lock_id).is_some_and(|r| r.owner == owner) {
            locks.remove(&lock_id);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
