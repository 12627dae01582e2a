//! Live-stream event shapes.
//!
//! These are never persisted; they exist only between the server's event hub
//! and a connected stream client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{JobId, JobStatus, ReviewJob};

/// A review job changed status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewEvent {
    #[serde(rename = "type")]
    pub kind: ReviewEventKind,
    pub job_id: JobId,
    pub project_id: i64,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewEventKind {
    /// A webhook produced a new job.
    ReviewCreated,
    /// An existing job moved to a new status.
    ReviewStatus,
    /// The retry sweep or an operator re-queued a failed job.
    ReviewRetried,
}

impl ReviewEvent {
    /// Snapshot a job's current status as an event.
    pub fn from_job(kind: ReviewEventKind, job: &ReviewJob) -> Self {
        Self {
            kind,
            job_id: job.id,
            project_id: job.project_id,
            status: job.status,
            score: job.score,
            timestamp: Utc::now(),
        }
    }
}

/// Progress of a repository import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportEvent {
    #[serde(rename = "type")]
    pub kind: ImportEventKind,
    pub import_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<i64>,
    pub processed: u64,
    pub total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportEventKind {
    ImportStarted,
    ImportProgress,
    ImportCompleted,
    ImportFailed,
}
