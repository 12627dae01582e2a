//! Redis-backed queue with a worker pool.
//!
//! Producers `LPUSH` a JSON [`QueueJobEnvelope`] onto the queue list. Each
//! worker `BRPOPLPUSH`es one envelope into its own processing list, runs it,
//! then `LREM`s it. A worker keeps a heartbeat key alive while it runs; the
//! recovery sweep pushes the processing list of any worker whose heartbeat
//! has lapsed back onto the queue, so a crash mid-job loses nothing.
//!
//! Worker ids are `<instance>:<n>`, so a restarted process reuses its old ids
//! and may find its heartbeats still alive. On start it therefore re-queues
//! whatever its own processing lists still hold before any worker polls.
//!
//! Key layout, for queue key `K`:
//!
//! ```text
//! K                      pending envelopes (consumed from the right)
//! K:workers              set of registered worker ids
//! K:processing:<worker>  envelope a worker is running
//! K:heartbeat:<worker>   expires when the worker stops refreshing it
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::redis::AsyncCommands;
use deadpool_redis::{Config as RedisConfig, Pool};
use revhook_core::JobId;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{execute, JobProcessor, ProcessorSlot, TaskQueue};
use crate::error::QueueError;

const HEARTBEAT_TTL: Duration = Duration::from_secs(30);
const HEARTBEAT_EVERY: Duration = Duration::from_secs(10);
const POLL_TIMEOUT_SECS: f64 = 5.0;

/// What travels through the broker. The job itself stays in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueJobEnvelope {
    pub job_id: JobId,
    pub enqueued_at: DateTime<Utc>,
    /// Deliveries so far; bumped when a crashed worker's envelope is recovered.
    pub attempt: u32,
}

impl QueueJobEnvelope {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            enqueued_at: Utc::now(),
            attempt: 1,
        }
    }
}

#[derive(Debug, Clone)]
struct Keys {
    queue: String,
}

impl Keys {
    fn workers(&self) -> String {
        format!("{}:workers", self.queue)
    }

    fn processing(&self, worker: &str) -> String {
        format!("{}:processing:{}", self.queue, worker)
    }

    fn heartbeat(&self, worker: &str) -> String {
        format!("{}:heartbeat:{}", self.queue, worker)
    }
}

fn broker(err: impl std::fmt::Display) -> QueueError {
    QueueError::Broker(err.to_string())
}

pub struct RedisQueue {
    pool: Pool,
    keys: Keys,
    instance_id: String,
    worker_count: usize,
    job_timeout: Duration,
    processor: ProcessorSlot,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RedisQueue {
    pub fn connect(
        url: &str,
        queue_key: &str,
        instance_id: &str,
        worker_count: usize,
        job_timeout: Duration,
    ) -> Result<Self> {
        let pool = RedisConfig::from_url(url)
            .create_pool(None)
            .context("Failed to create Redis pool")?;
        Ok(Self {
            pool,
            keys: Keys {
                queue: queue_key.to_string(),
            },
            instance_id: instance_id.to_string(),
            worker_count,
            job_timeout,
            processor: ProcessorSlot::default(),
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn worker_ids(&self) -> Vec<String> {
        (0..self.worker_count)
            .map(|n| format!("{}:{}", self.instance_id, n))
            .collect()
    }

    /// Recover orphans, then start the workers and the recovery sweep.
    ///
    /// Call after [`TaskQueue::set_processor`].
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let processor = self.processor.get()?;
        let reclaimed = self.reclaim_own().await?;
        if reclaimed > 0 {
            info!(reclaimed, "Re-queued envelopes left by a previous run of this instance");
        }
        let recovered = self.recover_orphans().await?;
        if recovered > 0 {
            info!(recovered, "Re-queued envelopes from dead workers");
        }

        let mut handles = self.handles.lock().await;
        for worker_id in self.worker_ids() {
            let queue = Arc::clone(self);
            let processor = processor.clone();
            handles.push(tokio::spawn(async move {
                queue.run_worker(worker_id, processor).await;
            }));
        }

        let queue = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            queue.run_recovery().await;
        }));

        info!(
            workers = self.worker_count,
            queue = %self.keys.queue,
            depth = self.depth().await?,
            "Redis workers started"
        );
        Ok(())
    }

    pub async fn depth(&self) -> Result<usize, QueueError> {
        let mut conn = self.pool.get().await.map_err(broker)?;
        conn.llen(&self.keys.queue).await.map_err(broker)
    }

    async fn run_worker(&self, worker_id: String, processor: Arc<dyn JobProcessor>) {
        let processing = self.keys.processing(&worker_id);
        if let Err(e) = self.register(&worker_id).await {
            error!(worker = %worker_id, error = %e, "Failed to register worker");
        }
        let heartbeat = self.spawn_heartbeat(worker_id.clone());

        loop {
            let raw = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                raw = self.poll(&processing) => raw,
            };
            let raw = match raw {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    warn!(worker = %worker_id, error = %e, "Queue poll failed, backing off");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
                    }
                }
            };

            match serde_json::from_str::<QueueJobEnvelope>(&raw) {
                Ok(envelope) => {
                    debug!(
                        worker = %worker_id,
                        job_id = %envelope.job_id,
                        attempt = envelope.attempt,
                        "Dequeued job"
                    );
                    execute(processor.as_ref(), envelope.job_id, self.job_timeout).await;
                }
                Err(e) => {
                    warn!(
                        worker = %worker_id,
                        error = %e,
                        payload = %raw,
                        "Dropping malformed envelope"
                    );
                }
            }

            if let Err(e) = self.ack(&processing, &raw).await {
                error!(worker = %worker_id, error = %e, "Failed to acknowledge envelope");
            }
        }

        heartbeat.abort();
        if let Err(e) = self.deregister(&worker_id).await {
            warn!(worker = %worker_id, error = %e, "Failed to deregister worker");
        }
        debug!(worker = %worker_id, "Worker stopped");
    }

    async fn poll(&self, processing: &str) -> Result<Option<String>, QueueError> {
        let mut conn = self.pool.get().await.map_err(broker)?;
        conn.brpoplpush(&self.keys.queue, processing, POLL_TIMEOUT_SECS)
            .await
            .map_err(broker)
    }

    async fn ack(&self, processing: &str, raw: &str) -> Result<(), QueueError> {
        let mut conn = self.pool.get().await.map_err(broker)?;
        let _: i64 = conn.lrem(processing, 1, raw).await.map_err(broker)?;
        Ok(())
    }

    async fn register(&self, worker_id: &str) -> Result<(), QueueError> {
        let mut conn = self.pool.get().await.map_err(broker)?;
        let _: () = conn
            .set_ex(self.keys.heartbeat(worker_id), 1, HEARTBEAT_TTL.as_secs())
            .await
            .map_err(broker)?;
        let _: i64 = conn
            .sadd(self.keys.workers(), worker_id)
            .await
            .map_err(broker)?;
        Ok(())
    }

    async fn deregister(&self, worker_id: &str) -> Result<(), QueueError> {
        let mut conn = self.pool.get().await.map_err(broker)?;
        let _: i64 = conn
            .del(self.keys.heartbeat(worker_id))
            .await
            .map_err(broker)?;
        // An envelope left behind (cancelled mid-job) is picked up by the sweep.
        let remaining: usize = conn
            .llen(self.keys.processing(worker_id))
            .await
            .map_err(broker)?;
        if remaining == 0 {
            let _: i64 = conn
                .srem(self.keys.workers(), worker_id)
                .await
                .map_err(broker)?;
        }
        Ok(())
    }

    fn spawn_heartbeat(&self, worker_id: String) -> JoinHandle<()> {
        let pool = self.pool.clone();
        let key = self.keys.heartbeat(&worker_id);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_EVERY);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let result = match pool.get().await {
                    Ok(mut conn) => conn
                        .set_ex::<_, _, ()>(&key, 1, HEARTBEAT_TTL.as_secs())
                        .await
                        .map_err(broker),
                    Err(e) => Err(broker(e)),
                };
                if let Err(e) = result {
                    warn!(worker = %worker_id, error = %e, "Heartbeat refresh failed");
                }
            }
        })
    }

    async fn run_recovery(&self) {
        let mut interval = tokio::time::interval(HEARTBEAT_TTL);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            match self.recover_orphans().await {
                Ok(0) => {}
                Ok(recovered) => info!(recovered, "Re-queued envelopes from dead workers"),
                Err(e) => warn!(error = %e, "Orphan recovery failed"),
            }
        }
    }

    /// Re-queue the processing lists of this instance's own worker ids.
    ///
    /// Only safe before this instance's workers start.
    async fn reclaim_own(&self) -> Result<usize, QueueError> {
        let mut conn = self.pool.get().await.map_err(broker)?;
        let mut reclaimed = 0;
        for worker in self.worker_ids() {
            reclaimed += self.requeue_processing(&mut conn, &worker).await?;
        }
        Ok(reclaimed)
    }

    /// Move envelopes held by workers whose heartbeat expired back onto the
    /// consuming end of the queue. Returns how many moved.
    pub async fn recover_orphans(&self) -> Result<usize, QueueError> {
        let mut conn = self.pool.get().await.map_err(broker)?;
        let workers: Vec<String> = conn.smembers(self.keys.workers()).await.map_err(broker)?;

        let mut recovered = 0;
        for worker in workers {
            let alive: bool = conn
                .exists(self.keys.heartbeat(&worker))
                .await
                .map_err(broker)?;
            if alive {
                continue;
            }
            recovered += self.requeue_processing(&mut conn, &worker).await?;
            let _: i64 = conn
                .srem(self.keys.workers(), &worker)
                .await
                .map_err(broker)?;
        }
        Ok(recovered)
    }

    /// Drain `worker`'s processing list onto the consuming end of the queue,
    /// counting each envelope as a new attempt.
    async fn requeue_processing(
        &self,
        conn: &mut deadpool_redis::Connection,
        worker: &str,
    ) -> Result<usize, QueueError> {
        let processing = self.keys.processing(worker);
        let mut moved = 0;
        loop {
            let raw: Option<String> = conn.rpop(&processing, None).await.map_err(broker)?;
            let Some(raw) = raw else { break };
            let requeued = match serde_json::from_str::<QueueJobEnvelope>(&raw) {
                Ok(mut envelope) => {
                    envelope.attempt = envelope.attempt.saturating_add(1);
                    warn!(
                        worker = %worker,
                        job_id = %envelope.job_id,
                        attempt = envelope.attempt,
                        "Recovering job from stopped worker"
                    );
                    serde_json::to_string(&envelope)?
                }
                Err(_) => raw,
            };
            let _: i64 = conn
                .rpush(&self.keys.queue, requeued)
                .await
                .map_err(broker)?;
            moved += 1;
        }
        Ok(moved)
    }
}

#[async_trait]
impl TaskQueue for RedisQueue {
    fn backend(&self) -> &'static str {
        "redis"
    }

    fn set_processor(&self, processor: Arc<dyn JobProcessor>) {
        self.processor.set(processor);
    }

    async fn enqueue(&self, job_id: JobId) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        let payload = serde_json::to_string(&QueueJobEnvelope::new(job_id))?;
        let mut conn = self.pool.get().await.map_err(broker)?;
        let depth: i64 = conn
            .lpush(&self.keys.queue, payload)
            .await
            .map_err(broker)?;
        debug!(job_id = %job_id, depth, "Enqueued job");
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        let handles = std::mem::take(&mut *self.handles.lock().await);
        // Workers finish their current envelope, bounded by the job timeout.
        let wait = futures_util::future::join_all(handles);
        if tokio::time::timeout(self.job_timeout + Duration::from_secs(5), wait)
            .await
            .is_err()
        {
            warn!("Redis workers did not stop in time");
        }
    }
}
