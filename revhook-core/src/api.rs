//! Request/response bodies shared by the server and the CLI.

use serde::{Deserialize, Serialize};

use crate::job::{JobId, JobStatus};

/// Body of `POST /api/review/sync`, sent by pre-receive hooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReviewRequest {
    pub project_id: i64,
    pub commit_hash: String,
    #[serde(default)]
    pub base_commit: Option<String>,
    pub branch: String,
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub author_email: Option<String>,
    #[serde(default)]
    pub commit_message: String,
    pub diff: String,
}

/// Verdict returned by `POST /api/review/sync`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReviewResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub score: Option<f64>,
    pub min_score: f64,
    /// `true` when the push may proceed.
    pub passed: bool,
    #[serde(default)]
    pub review: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Body of `GET /api/review/score`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreResponse {
    pub project_id: i64,
    pub commit_hash: String,
    pub job_id: JobId,
    pub status: JobStatus,
    pub score: Option<f64>,
    pub min_score: f64,
    /// `None` until the job reaches a terminal status.
    pub passed: Option<bool>,
}

/// Decide whether a finished review lets a change through.
///
/// Skipped jobs pass (nothing reviewable changed). Failed jobs never pass:
/// a review that did not complete is not a low score.
pub fn gate_verdict(status: JobStatus, score: Option<f64>, min_score: f64) -> Option<bool> {
    match status {
        JobStatus::Completed => Some(score.is_some_and(|s| s >= min_score)),
        JobStatus::Skipped => Some(true),
        JobStatus::Failed => Some(false),
        JobStatus::Pending | JobStatus::Analyzing => None,
    }
}
