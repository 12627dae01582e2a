//! Chat notifications for finished reviews.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use revhook_core::{JobId, JobStatus, ReviewJob};
use serde::Serialize;
use tracing::{debug, warn};

use crate::projects::Project;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub job_id: JobId,
    pub project_id: i64,
    pub project_name: String,
    pub branch: String,
    pub commit_hash: String,
    pub author: String,
    pub status: JobStatus,
    pub score: Option<f64>,
    pub min_score: f64,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_request_url: Option<String>,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn for_job(project: &Project, job: &ReviewJob) -> Self {
        let passed = job.score.is_some_and(|s| s >= project.min_score);
        let score = job
            .score
            .map(|s| format!("{:.0}", s))
            .unwrap_or_else(|| "-".to_string());
        let text = format!(
            "[{}] {} on {} by {}: score {} ({})",
            project.name,
            job.short_commit(),
            job.branch,
            job.author.name,
            score,
            if passed { "passed" } else { "below threshold" }
        );
        Self {
            job_id: job.id,
            project_id: project.id,
            project_name: project.name.clone(),
            branch: job.branch.clone(),
            commit_hash: job.commit_hash.clone(),
            author: job.author.name.clone(),
            status: job.status,
            score: job.score,
            min_score: project.min_score,
            passed,
            merge_request_url: job.merge_request.as_ref().and_then(|m| m.url.clone()),
            text,
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn send(&self, project: &Project, notification: &Notification) -> Result<()>;
}

/// Posts the notification as JSON to the project's webhook URL.
pub struct WebhookNotifier {
    client: Client,
}

impl WebhookNotifier {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NotificationService for WebhookNotifier {
    async fn send(&self, project: &Project, notification: &Notification) -> Result<()> {
        let Some(url) = project.notify_webhook_url.as_deref() else {
            return Ok(());
        };
        let response = self
            .client
            .post(url)
            .json(notification)
            .send()
            .await
            .context("Failed to send notification")?;
        if !response.status().is_success() {
            bail!("Notification webhook returned {}", response.status());
        }
        debug!(job_id = %notification.job_id, "Notification delivered");
        Ok(())
    }
}

/// Send and swallow the error; notifications never affect the job.
pub async fn notify_best_effort(
    notifier: &dyn NotificationService,
    project: &Project,
    job: &ReviewJob,
) {
    if project.notify_webhook_url.is_none() {
        return;
    }
    let notification = Notification::for_job(project, job);
    if let Err(e) = notifier.send(project, &notification).await {
        warn!(job_id = %job.id, project_id = project.id, "Notification failed: {:#}", e);
    }
}
