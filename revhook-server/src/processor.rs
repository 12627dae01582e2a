//! The review pipeline behind both queue backends.
//!
//! Every job, fresh or retried, inline or from Redis, goes through
//! [`ReviewProcessor::process`]. Each status change is written to the store
//! before it is published, so live subscribers never see a status the store
//! does not yet hold.

use std::sync::Arc;

use async_trait::async_trait;
use revhook_core::{FileDiff, JobId, JobStatus, ReviewEvent, ReviewEventKind, ReviewJob};
use tracing::{debug, info, warn};

use crate::engine::{ReviewEngine, ReviewRequest};
use crate::error::{ProcessError, StoreError};
use crate::hub::EventHub;
use crate::notify::{notify_best_effort, NotificationService};
use crate::platform_client::{CommitState, PlatformClient};
use crate::projects::{Project, ProjectService};
use crate::queue::JobProcessor;
use crate::store::JobStore;

/// Bounds on the file contents sent along with a diff.
#[derive(Debug, Clone, Copy)]
pub struct FileSizeLimits {
    pub max_file_size: usize,
    pub max_total_size: usize,
}

impl Default for FileSizeLimits {
    fn default() -> Self {
        Self {
            max_file_size: 100 * 1024,
            max_total_size: 1024 * 1024,
        }
    }
}

pub struct ReviewProcessor {
    store: Arc<dyn JobStore>,
    projects: Arc<dyn ProjectService>,
    platform: Arc<dyn PlatformClient>,
    engine: Arc<dyn ReviewEngine>,
    notifier: Arc<dyn NotificationService>,
    hub: Arc<EventHub<ReviewEvent>>,
    limits: FileSizeLimits,
}

impl ReviewProcessor {
    pub fn new(
        store: Arc<dyn JobStore>,
        projects: Arc<dyn ProjectService>,
        platform: Arc<dyn PlatformClient>,
        engine: Arc<dyn ReviewEngine>,
        notifier: Arc<dyn NotificationService>,
        hub: Arc<EventHub<ReviewEvent>>,
    ) -> Self {
        Self {
            store,
            projects,
            platform,
            engine,
            notifier,
            hub,
            limits: FileSizeLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: FileSizeLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Write `job`, then tell subscribers.
    async fn save(&self, job: &ReviewJob) -> Result<(), StoreError> {
        self.store.update(job).await?;
        self.hub
            .publish(ReviewEvent::from_job(ReviewEventKind::ReviewStatus, job));
        Ok(())
    }

    async fn load_diff(
        &self,
        project: &Project,
        job: &mut ReviewJob,
    ) -> Result<String, ProcessError> {
        if let Some(diff) = job.diff.as_ref().filter(|d| !d.trim().is_empty()) {
            return Ok(diff.clone());
        }
        let diff = self
            .platform
            .fetch_diff(project, job)
            .await
            .map_err(|e| ProcessError::transient(format!("diff fetch failed: {:#}", e)))?;
        job.diff = Some(diff.clone());
        Ok(diff)
    }

    /// Post-change contents of the reviewed files, within the size limits.
    ///
    /// Missing or oversized files are left out; fetch errors only cost the
    /// context for that file.
    async fn file_context(
        &self,
        project: &Project,
        job: &ReviewJob,
        files: &[FileDiff],
    ) -> Vec<(String, String)> {
        let mut context = Vec::new();
        let mut total = 0usize;
        for file in files.iter().filter(|f| !f.deleted) {
            match self.platform.fetch_file(project, &job.commit_hash, &file.path).await {
                Ok(Some(content)) => {
                    if content.len() > self.limits.max_file_size {
                        debug!(
                            path = %file.path,
                            size = content.len(),
                            "File too large for context"
                        );
                        continue;
                    }
                    if total + content.len() > self.limits.max_total_size {
                        debug!(path = %file.path, "Context budget exhausted");
                        break;
                    }
                    total += content.len();
                    context.push((file.path.clone(), content));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(job_id = %job.id, path = %file.path, "Could not fetch file: {:#}", e)
                }
            }
        }
        context
    }

    async fn report(&self, project: &Project, job: &ReviewJob) {
        let Some(score) = job.score else {
            return;
        };
        let (state, verdict) = if score >= project.min_score {
            (CommitState::Success, "passed")
        } else {
            (CommitState::Failure, "below threshold")
        };
        let description = format!(
            "Review score {:.0} ({} {:.0})",
            score,
            verdict,
            project.min_score
        );
        if let Err(e) = self
            .platform
            .set_commit_status(project, job, state, &description)
            .await
        {
            warn!(job_id = %job.id, "Failed to set commit status: {:#}", e);
        }

        if project.comment_enabled {
            let body = format!(
                "## Code review: {:.0}/100\n\n{}",
                score,
                job.review_result.as_deref().unwrap_or_default()
            );
            if let Err(e) = self.platform.post_comment(project, job, &body).await {
                warn!(job_id = %job.id, "Failed to post review comment: {:#}", e);
            }
        }

        notify_best_effort(self.notifier.as_ref(), project, job).await;
    }
}

#[async_trait]
impl JobProcessor for ReviewProcessor {
    async fn process(&self, job_id: JobId) -> Result<(), ProcessError> {
        let mut job = self
            .store
            .get(job_id)
            .await?
            .ok_or(StoreError::NotFound(job_id.0))?;

        // A redelivered envelope for a job that already finished.
        if matches!(job.status, JobStatus::Completed | JobStatus::Skipped) {
            info!(job_id = %job_id, status = %job.status, "Job already finished, nothing to do");
            return Ok(());
        }

        let project = self
            .projects
            .get_by_id(job.project_id)
            .await
            .ok_or_else(|| {
                ProcessError::Transient(format!("project {} not found", job.project_id))
            })?;

        job.mark_analyzing();
        self.save(&job).await?;
        info!(
            job_id = %job.id,
            project_id = project.id,
            commit = %job.short_commit(),
            attempt = job.retry_count + 1,
            "Reviewing commit"
        );

        if let Err(e) = self
            .platform
            .set_commit_status(&project, &job, CommitState::Pending, "Review in progress")
            .await
        {
            debug!(job_id = %job.id, "Failed to set pending status: {:#}", e);
        }

        let diff = self.load_diff(&project, &mut job).await?;
        let filter = project.diff_filter().map_err(ProcessError::transient)?;
        let filtered = filter.apply(&diff);
        job.stats = filtered.stats.clone();

        debug!(
            job_id = %job.id,
            files = ?filtered.paths().collect::<Vec<_>>(),
            "Reviewable files"
        );
        if filtered.is_empty() {
            info!(job_id = %job.id, "No reviewable files after filtering");
            job.mark_skipped("No reviewable changes after filtering");
            self.save(&job).await?;
            return Ok(());
        }

        let file_context = if project.file_context {
            self.file_context(&project, &job, &filtered.files).await
        } else {
            Vec::new()
        };

        let outcome = self
            .engine
            .review(ReviewRequest {
                job: &job,
                files: &filtered.files,
                file_context: &file_context,
            })
            .await
            .map_err(|e| ProcessError::transient(format!("review failed: {:#}", e)))?;

        job.mark_completed(outcome.score, outcome.content);
        self.save(&job).await?;
        info!(job_id = %job.id, score = outcome.score, "Review completed");

        self.report(&project, &job).await;
        Ok(())
    }

    async fn record_failure(&self, job_id: JobId, message: String) {
        let mut job = match self.store.get(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id = %job_id, "Cannot record failure for missing job");
                return;
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Cannot load job to record failure");
                return;
            }
        };
        if matches!(job.status, JobStatus::Completed | JobStatus::Skipped) {
            return;
        }
        job.mark_failed(message);
        if let Err(e) = self.save(&job).await {
            warn!(job_id = %job_id, error = %e, "Failed to persist job failure");
        }
    }
}
