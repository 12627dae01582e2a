//! In-process backend: each job runs as a tokio task.
//!
//! No external dependency. Jobs in flight when the process dies are lost;
//! the retry sweep will not see them because they never reached `failed`.
//! Concurrency is capped by a semaphore so a burst of webhooks cannot spawn
//! unbounded work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use revhook_core::JobId;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::{execute, JobProcessor, ProcessorSlot, TaskQueue};
use crate::error::QueueError;

pub struct InlineQueue {
    processor: ProcessorSlot,
    permits: Arc<Semaphore>,
    tasks: TaskTracker,
    closed: AtomicBool,
    job_timeout: Duration,
}

impl InlineQueue {
    pub fn new(max_in_flight: usize, job_timeout: Duration) -> Self {
        Self {
            processor: ProcessorSlot::default(),
            permits: Arc::new(Semaphore::new(max_in_flight)),
            tasks: TaskTracker::new(),
            closed: AtomicBool::new(false),
            job_timeout,
        }
    }
}

#[async_trait]
impl TaskQueue for InlineQueue {
    fn backend(&self) -> &'static str {
        "inline"
    }

    fn set_processor(&self, processor: Arc<dyn JobProcessor>) {
        self.processor.set(processor);
    }

    async fn enqueue(&self, job_id: JobId) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        let processor = self.processor.get()?;
        let permits = self.permits.clone();
        let timeout = self.job_timeout;

        self.tasks.spawn(async move {
            // Waiting for a permit happens off the request path.
            let Ok(_permit) = permits.acquire_owned().await else {
                warn!(job_id = %job_id, "Queue shut down before job started");
                return;
            };
            debug!(job_id = %job_id, "Running job inline");
            execute(processor.as_ref(), job_id, timeout).await;
        });
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.tasks.close();
        let pending = self.tasks.len();
        if pending > 0 {
            info!(pending, "Draining in-flight jobs");
        }
        // Each job is already bounded by the job timeout; allow one more for queued ones.
        if tokio::time::timeout(self.job_timeout * 2, self.tasks.wait())
            .await
            .is_err()
        {
            warn!(remaining = self.tasks.len(), "Gave up waiting for in-flight jobs");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::testing::RecordingProcessor;

    #[tokio::test]
    async fn test_enqueue_without_processor_fails() {
        let queue = InlineQueue::new(4, Duration::from_secs(5));
        assert!(matches!(
            queue.enqueue(JobId(1)).await,
            Err(QueueError::NoProcessor)
        ));
    }

    #[tokio::test]
    async fn test_enqueue_runs_processor_and_close_drains() {
        let queue = InlineQueue::new(4, Duration::from_secs(5));
        let processor = Arc::new(RecordingProcessor::default());
        *processor.delay.lock().unwrap() = Some(Duration::from_millis(20));
        queue.set_processor(processor.clone());

        for id in 1..=3 {
            queue.enqueue(JobId(id)).await.unwrap();
        }
        queue.close().await;

        let mut processed = processor.processed();
        processed.sort();
        assert_eq!(processed, vec![JobId(1), JobId(2), JobId(3)]);
    }

    #[tokio::test]
    async fn test_closed_queue_rejects() {
        let queue = InlineQueue::new(1, Duration::from_secs(5));
        queue.set_processor(Arc::new(RecordingProcessor::default()));
        queue.close().await;
        assert!(matches!(queue.enqueue(JobId(9)).await, Err(QueueError::Closed)));
    }

    #[tokio::test]
    async fn test_in_flight_capped_by_permits() {
        let queue = InlineQueue::new(1, Duration::from_secs(5));
        let processor = Arc::new(RecordingProcessor::default());
        *processor.delay.lock().unwrap() = Some(Duration::from_millis(200));
        queue.set_processor(processor.clone());

        queue.enqueue(JobId(1)).await.unwrap();
        queue.enqueue(JobId(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Only the first has had a permit long enough to finish.
        assert_eq!(processor.processed(), vec![JobId(1)]);
        queue.close().await;
        assert_eq!(processor.processed().len(), 2);
    }

    #[tokio::test]
    async fn test_failures_recorded_not_retried() {
        let queue = InlineQueue::new(2, Duration::from_secs(5));
        let processor = Arc::new(RecordingProcessor::default());
        *processor.fail_with.lock().unwrap() = Some("diff fetch failed".into());
        queue.set_processor(processor.clone());

        queue.enqueue(JobId(7)).await.unwrap();
        queue.close().await;

        assert_eq!(processor.processed(), vec![JobId(7)]);
        assert_eq!(processor.failures().len(), 1);
    }
}
