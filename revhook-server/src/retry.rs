//! Periodic re-drive of failed jobs.
//!
//! Every instance runs the loop; the `retry-scheduler` lease in the shared
//! store makes sure only one of them sweeps per cycle. The lease is not
//! released after a sweep, it simply runs out before the next tick.
//!
//! A job left pending or analyzing by a crashed process would otherwise block
//! new deliveries of its commit forever. The sweep fails any such job once it
//! has gone `stale_after` without an update, which makes it retryable.

use std::sync::Arc;

use chrono::Utc;
use revhook_core::{JobId, JobStatus, ReviewEvent, ReviewEventKind, ReviewJob};
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RetrySettings;
use crate::error::{QueueError, StoreError};
use crate::hub::EventHub;
use crate::queue::TaskQueue;
use crate::store::{DistributedLock, JobStore};

pub const LOCK_NAME: &str = "retry-scheduler";
pub const LOCK_KEY: &str = "global";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Another instance holds the lease this cycle.
    LockDenied,
    /// Number of jobs re-queued, including recovered stale ones.
    Swept(usize),
}

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {0} is {1}, only failed jobs can be retried")]
    NotFailed(JobId, JobStatus),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub struct RetryScheduler {
    store: Arc<dyn JobStore>,
    lock: Arc<dyn DistributedLock>,
    queue: Arc<dyn TaskQueue>,
    hub: Arc<EventHub<ReviewEvent>>,
    settings: RetrySettings,
    owner: String,
}

impl RetryScheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        lock: Arc<dyn DistributedLock>,
        queue: Arc<dyn TaskQueue>,
        hub: Arc<EventHub<ReviewEvent>>,
        settings: RetrySettings,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            store,
            lock,
            queue,
            hub,
            settings,
            owner: owner.into(),
        }
    }

    /// One cycle: take the lease, then re-queue what is eligible.
    pub async fn sweep_once(&self) -> Result<SweepOutcome, StoreError> {
        let acquired = self
            .lock
            .try_acquire(LOCK_NAME, LOCK_KEY, &self.owner, self.settings.lock_ttl)
            .await?;
        if !acquired {
            debug!(owner = %self.owner, "Retry lease held elsewhere, skipping sweep");
            return Ok(SweepOutcome::LockDenied);
        }

        self.fail_stale().await?;

        let jobs = self
            .store
            .list_retryable(self.settings.max_attempts, self.settings.batch_size)
            .await?;
        if jobs.is_empty() {
            return Ok(SweepOutcome::Swept(0));
        }
        info!(count = jobs.len(), "Retrying failed jobs");

        let mut swept = 0;
        for job in jobs {
            // Re-check: the listing is a snapshot.
            if !job.is_retryable(self.settings.max_attempts) {
                continue;
            }
            match self.redrive(job).await {
                Ok(()) => swept += 1,
                Err(e) => error!(error = %e, "Failed to re-queue job"),
            }
        }
        Ok(SweepOutcome::Swept(swept))
    }

    /// Fail every pending or analyzing job with no update for `stale_after`.
    async fn fail_stale(&self) -> Result<usize, StoreError> {
        let stale_after = chrono::Duration::from_std(self.settings.stale_after)
            .map_err(|e| StoreError::storage("stale threshold", e))?;
        let cutoff = Utc::now() - stale_after;
        let jobs = self
            .store
            .list_stale(cutoff, self.settings.batch_size)
            .await?;

        for mut job in jobs.iter().cloned() {
            warn!(
                job_id = %job.id,
                status = %job.status,
                idle_secs = (Utc::now() - job.updated_at).num_seconds(),
                "Failing abandoned job"
            );
            job.mark_failed(format!(
                "abandoned: no progress for {}s",
                self.settings.stale_after.as_secs()
            ));
            self.store.update(&job).await?;
            self.hub
                .publish(ReviewEvent::from_job(ReviewEventKind::ReviewStatus, &job));
        }
        Ok(jobs.len())
    }

    /// Flip to pending, persist, announce, enqueue.
    ///
    /// If the enqueue fails the job goes back to `failed`, with the attempt
    /// already counted, so a later sweep can still find it.
    async fn redrive(&self, mut job: ReviewJob) -> Result<(), RetryError> {
        job.begin_retry();
        self.store.update(&job).await?;
        self.hub
            .publish(ReviewEvent::from_job(ReviewEventKind::ReviewRetried, &job));
        info!(job_id = %job.id, attempt = job.retry_count, "Job re-queued");

        if let Err(e) = self.queue.enqueue(job.id).await {
            job.mark_failed(format!("re-queue failed: {}", e));
            self.store.update(&job).await?;
            self.hub
                .publish(ReviewEvent::from_job(ReviewEventKind::ReviewStatus, &job));
            return Err(e.into());
        }
        Ok(())
    }

    /// Operator-triggered retry. Ignores the lease and the attempt cap.
    pub async fn retry_now(&self, job_id: JobId) -> Result<ReviewJob, RetryError> {
        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or(RetryError::NotFound(job_id))?;
        if job.status != JobStatus::Failed {
            return Err(RetryError::NotFailed(job_id, job.status));
        }
        info!(job_id = %job_id, "Manual retry requested");
        self.redrive(job).await?;
        self.store
            .get(job_id)
            .await?
            .ok_or(RetryError::NotFound(job_id))
    }

    /// Sweep every `interval` until `shutdown` fires, then give up the lease.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_secs = self.settings.interval.as_secs(),
            max_attempts = self.settings.max_attempts,
            "Retry scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(SweepOutcome::Swept(n)) if n > 0 => {
                            info!(count = n, "Retry sweep finished")
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Retry sweep failed"),
                    }
                }
            }
        }

        match self.lock.release(LOCK_NAME, LOCK_KEY, &self.owner).await {
            Ok(true) => info!("Released retry lease"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Failed to release retry lease"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::DEFAULT_CLIENT_BUFFER;
    use crate::queue::JobProcessor;
    use crate::store::contract::new_job;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Queue that "runs" each job synchronously by failing it again.
    struct AlwaysFailingQueue {
        store: Arc<InMemoryStore>,
        enqueued: Mutex<Vec<JobId>>,
    }

    #[async_trait]
    impl TaskQueue for AlwaysFailingQueue {
        fn backend(&self) -> &'static str {
            "test"
        }

        fn set_processor(&self, _processor: Arc<dyn JobProcessor>) {}

        async fn enqueue(&self, job_id: JobId) -> Result<(), QueueError> {
            self.enqueued.lock().unwrap().push(job_id);
            let mut job = self.store.get(job_id).await.unwrap().unwrap();
            job.mark_analyzing();
            job.mark_failed("engine unavailable");
            self.store.update(&job).await.unwrap();
            Ok(())
        }

        async fn close(&self) {}
    }

    struct ClosedQueue;

    #[async_trait]
    impl TaskQueue for ClosedQueue {
        fn backend(&self) -> &'static str {
            "closed"
        }

        fn set_processor(&self, _processor: Arc<dyn JobProcessor>) {}

        async fn enqueue(&self, _job_id: JobId) -> Result<(), QueueError> {
            Err(QueueError::Closed)
        }

        async fn close(&self) {}
    }

    fn settings() -> RetrySettings {
        RetrySettings {
            interval: Duration::from_secs(180),
            lock_ttl: Duration::from_secs(150),
            max_attempts: 3,
            batch_size: 50,
            stale_after: Duration::from_secs(600),
        }
    }

    fn scheduler(
        store: Arc<InMemoryStore>,
        queue: Arc<dyn TaskQueue>,
        owner: &str,
    ) -> RetryScheduler {
        RetryScheduler::new(
            store.clone(),
            store,
            queue,
            Arc::new(EventHub::new("reviews", DEFAULT_CLIENT_BUFFER)),
            settings(),
            owner,
        )
    }

    async fn failed_job(store: &InMemoryStore, commit: &str) -> ReviewJob {
        let mut job = store
            .create_unless_active(new_job(1, commit))
            .await
            .unwrap()
            .job()
            .clone();
        job.mark_failed("diff fetch failed");
        store.update(&job).await.unwrap();
        job
    }

    #[tokio::test]
    async fn test_retry_cap_is_respected() {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(AlwaysFailingQueue {
            store: store.clone(),
            enqueued: Mutex::new(Vec::new()),
        });
        let scheduler = scheduler(store.clone(), queue.clone(), "a");
        let job = failed_job(&store, "abc").await;

        for _ in 0..6 {
            scheduler.sweep_once().await.unwrap();
        }

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.retry_count, 3);
        assert_eq!(queue.enqueued.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_only_one_of_two_racing_schedulers_sweeps() {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(AlwaysFailingQueue {
            store: store.clone(),
            enqueued: Mutex::new(Vec::new()),
        });
        failed_job(&store, "race").await;

        let a = scheduler(store.clone(), queue.clone(), "instance-a");
        let b = scheduler(store.clone(), queue.clone(), "instance-b");
        let (ra, rb) = tokio::join!(a.sweep_once(), b.sweep_once());
        let outcomes = [ra.unwrap(), rb.unwrap()];

        let denied = outcomes
            .iter()
            .filter(|o| **o == SweepOutcome::LockDenied)
            .count();
        assert_eq!(denied, 1);
        assert!(outcomes.contains(&SweepOutcome::Swept(1)));
        assert_eq!(queue.enqueued.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_skipped_jobs_are_never_swept() {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(AlwaysFailingQueue {
            store: store.clone(),
            enqueued: Mutex::new(Vec::new()),
        });
        let mut job = store
            .create_unless_active(new_job(1, "docs"))
            .await
            .unwrap()
            .job()
            .clone();
        job.mark_skipped("nothing to review");
        store.update(&job).await.unwrap();

        let outcome = scheduler(store.clone(), queue.clone(), "a")
            .sweep_once()
            .await
            .unwrap();
        assert_eq!(outcome, SweepOutcome::Swept(0));
        assert!(queue.enqueued.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_manual_retry_bypasses_cap() {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(AlwaysFailingQueue {
            store: store.clone(),
            enqueued: Mutex::new(Vec::new()),
        });
        let scheduler = scheduler(store.clone(), queue.clone(), "a");
        let mut job = failed_job(&store, "capped").await;
        job.retry_count = 3;
        store.update(&job).await.unwrap();

        assert_eq!(scheduler.sweep_once().await.unwrap(), SweepOutcome::Swept(0));
        let retried = scheduler.retry_now(job.id).await.unwrap();
        assert_eq!(retried.retry_count, 4);
        assert_eq!(queue.enqueued.lock().unwrap().as_slice(), &[job.id]);
    }

    #[tokio::test]
    async fn test_manual_retry_rejects_unfinished_and_missing() {
        let store = Arc::new(InMemoryStore::new());
        let scheduler = scheduler(store.clone(), Arc::new(ClosedQueue), "a");
        let pending = store
            .create_unless_active(new_job(1, "p"))
            .await
            .unwrap()
            .job()
            .clone();

        assert!(matches!(
            scheduler.retry_now(pending.id).await,
            Err(RetryError::NotFailed(_, JobStatus::Pending))
        ));
        assert!(matches!(
            scheduler.retry_now(JobId(999)).await,
            Err(RetryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_enqueue_leaves_job_retryable() {
        let store = Arc::new(InMemoryStore::new());
        let scheduler = scheduler(store.clone(), Arc::new(ClosedQueue), "a");
        let job = failed_job(&store, "q").await;

        assert_eq!(scheduler.sweep_once().await.unwrap(), SweepOutcome::Swept(0));
        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.is_retryable(3));
    }

    #[tokio::test]
    async fn test_abandoned_job_is_failed_and_redriven() {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(AlwaysFailingQueue {
            store: store.clone(),
            enqueued: Mutex::new(Vec::new()),
        });
        let scheduler = scheduler(store.clone(), queue.clone(), "a");

        let mut stuck = store
            .create_unless_active(new_job(1, "crashed"))
            .await
            .unwrap()
            .job()
            .clone();
        stuck.mark_analyzing();
        stuck.updated_at = Utc::now() - chrono::Duration::minutes(11);
        store.update(&stuck).await.unwrap();

        let mut busy = store
            .create_unless_active(new_job(1, "running"))
            .await
            .unwrap()
            .job()
            .clone();
        busy.mark_analyzing();
        store.update(&busy).await.unwrap();

        assert_eq!(scheduler.sweep_once().await.unwrap(), SweepOutcome::Swept(1));
        assert_eq!(queue.enqueued.lock().unwrap().as_slice(), &[stuck.id]);

        let stored = store.get(stuck.id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 1);
        let running = store.get(busy.id).await.unwrap().unwrap();
        assert_eq!(running.status, JobStatus::Analyzing);
        assert_eq!(running.retry_count, 0);
    }

    #[tokio::test]
    async fn test_abandoned_job_no_longer_blocks_new_delivery() {
        let store = Arc::new(InMemoryStore::new());
        // No automatic attempts, so the sweep only recovers.
        let scheduler = RetryScheduler::new(
            store.clone(),
            store.clone(),
            Arc::new(ClosedQueue),
            Arc::new(EventHub::new("reviews", DEFAULT_CLIENT_BUFFER)),
            RetrySettings {
                max_attempts: 0,
                ..settings()
            },
            "a",
        );

        let mut stuck = store
            .create_unless_active(new_job(1, "blocked"))
            .await
            .unwrap()
            .job()
            .clone();
        stuck.updated_at = Utc::now() - chrono::Duration::hours(1);
        store.update(&stuck).await.unwrap();
        assert!(matches!(
            store.create_unless_active(new_job(1, "blocked")).await.unwrap(),
            crate::store::CreateOutcome::Duplicate(_)
        ));

        assert_eq!(scheduler.sweep_once().await.unwrap(), SweepOutcome::Swept(0));
        let stored = store.get(stuck.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.error_message.as_deref().unwrap().contains("abandoned"));

        assert!(matches!(
            store.create_unless_active(new_job(1, "blocked")).await.unwrap(),
            crate::store::CreateOutcome::Created(_)
        ));
    }

    #[tokio::test]
    async fn test_run_releases_lease_on_shutdown() {
        let store = Arc::new(InMemoryStore::new());
        let scheduler = Arc::new(scheduler(store.clone(), Arc::new(ClosedQueue), "a"));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(scheduler.clone().run(shutdown.clone()));

        // The first tick fires immediately and takes the lease.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!store
            .try_acquire(LOCK_NAME, LOCK_KEY, "b", Duration::from_secs(60))
            .await
            .unwrap());

        shutdown.cancel();
        handle.await.unwrap();
        assert!(store
            .try_acquire(LOCK_NAME, LOCK_KEY, "b", Duration::from_secs(60))
            .await
            .unwrap());
    }
}
