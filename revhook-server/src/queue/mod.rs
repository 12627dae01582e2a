//! Job execution: "run this job now", behind one interface.
//!
//! The ingestor and the retry scheduler only ever see [`TaskQueue`]. Which
//! backend runs the job is chosen once at start-up.

pub mod inline;
pub mod redis;

pub use inline::InlineQueue;
pub use redis::RedisQueue;

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use revhook_core::JobId;
use tracing::error;

use crate::error::{ProcessError, QueueError};

/// The single code path both backends call for a job.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Run the review for `job_id` to a terminal status.
    ///
    /// `Ok` covers both completed and skipped jobs. An `Err` leaves the job
    /// for [`record_failure`](Self::record_failure).
    async fn process(&self, job_id: JobId) -> Result<(), ProcessError>;

    /// Persist `failed` with `message` and announce it.
    async fn record_failure(&self, job_id: JobId, message: String);
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    fn backend(&self) -> &'static str;

    fn set_processor(&self, processor: Arc<dyn JobProcessor>);

    async fn enqueue(&self, job_id: JobId) -> Result<(), QueueError>;

    /// Stop accepting jobs and wait for in-flight ones to settle.
    async fn close(&self);
}

/// Slot holding the registered processor.
///
/// The processor depends on the queue's collaborators, so it is registered
/// after construction.
#[derive(Default)]
pub(crate) struct ProcessorSlot(RwLock<Option<Arc<dyn JobProcessor>>>);

impl ProcessorSlot {
    pub(crate) fn set(&self, processor: Arc<dyn JobProcessor>) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = Some(processor);
    }

    pub(crate) fn get(&self) -> Result<Arc<dyn JobProcessor>, QueueError> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(QueueError::NoProcessor)
    }
}

/// Run one job under the per-job timeout.
///
/// Failures are recorded on the job and never retried here; retrying is the
/// retry scheduler's job alone.
pub(crate) async fn execute(processor: &dyn JobProcessor, job_id: JobId, timeout: Duration) {
    match tokio::time::timeout(timeout, processor.process(job_id)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(job_id = %job_id, error = %e, "Review job failed");
            processor.record_failure(job_id, e.to_string()).await;
        }
        Err(_) => {
            error!(job_id = %job_id, timeout_secs = timeout.as_secs(), "Review job timed out");
            processor
                .record_failure(
                    job_id,
                    format!("timed out after {}s", timeout.as_secs()),
                )
                .await;
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    /// Processor that records calls and can be told to fail or stall.
    #[derive(Default)]
    pub struct RecordingProcessor {
        pub processed: Mutex<Vec<JobId>>,
        pub failures: Mutex<Vec<(JobId, String)>>,
        pub fail_with: Mutex<Option<String>>,
        pub delay: Mutex<Option<Duration>>,
        pub done: Notify,
    }

    impl RecordingProcessor {
        pub fn processed(&self) -> Vec<JobId> {
            self.processed.lock().unwrap().clone()
        }

        pub fn failures(&self) -> Vec<(JobId, String)> {
            self.failures.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl JobProcessor for RecordingProcessor {
        async fn process(&self, job_id: JobId) -> Result<(), ProcessError> {
            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.processed.lock().unwrap().push(job_id);
            let fail = self.fail_with.lock().unwrap().clone();
            let result = match fail {
                Some(message) => Err(ProcessError::Transient(message)),
                None => Ok(()),
            };
            self.done.notify_waiters();
            result
        }

        async fn record_failure(&self, job_id: JobId, message: String) {
            self.failures.lock().unwrap().push((job_id, message));
        }
    }

    /// Queue that only remembers what it was given.
    #[derive(Default)]
    pub struct RecordingQueue {
        pub enqueued: Mutex<Vec<JobId>>,
        pub reject: Mutex<bool>,
    }

    impl RecordingQueue {
        pub fn enqueued(&self) -> Vec<JobId> {
            self.enqueued.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TaskQueue for RecordingQueue {
        fn backend(&self) -> &'static str {
            "recording"
        }

        fn set_processor(&self, _processor: Arc<dyn JobProcessor>) {}

        async fn enqueue(&self, job_id: JobId) -> Result<(), QueueError> {
            if *self.reject.lock().unwrap() {
                return Err(QueueError::Closed);
            }
            self.enqueued.lock().unwrap().push(job_id);
            Ok(())
        }

        async fn close(&self) {}
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingProcessor;
    use super::*;

    #[tokio::test]
    async fn test_execute_records_transient_failure() {
        let processor = RecordingProcessor::default();
        *processor.fail_with.lock().unwrap() = Some("engine unavailable".into());

        execute(&processor, JobId(3), Duration::from_secs(5)).await;

        assert_eq!(
            processor.failures(),
            vec![(JobId(3), "engine unavailable".to_string())]
        );
    }

    #[tokio::test]
    async fn test_execute_times_out() {
        let processor = RecordingProcessor::default();
        *processor.delay.lock().unwrap() = Some(Duration::from_secs(60));

        execute(&processor, JobId(4), Duration::from_millis(20)).await;

        let failures = processor.failures();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].1.contains("timed out"));
        assert!(processor.processed().is_empty());
    }

    #[tokio::test]
    async fn test_execute_success_records_nothing() {
        let processor = RecordingProcessor::default();
        execute(&processor, JobId(5), Duration::from_secs(5)).await;
        assert_eq!(processor.processed(), vec![JobId(5)]);
        assert!(processor.failures().is_empty());
    }

    #[test]
    fn test_empty_slot_is_no_processor() {
        let slot = ProcessorSlot::default();
        assert!(matches!(slot.get(), Err(QueueError::NoProcessor)));
    }
}
