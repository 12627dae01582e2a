//! The review job: one unit of code-review work derived from a webhook.
//!
//! A job's status moves strictly forward:
//!
//! ```text
//! pending -> analyzing -> completed | failed | skipped
//!    ^                                 |
//!    +------------ (retry) ------------+
//! ```
//!
//! `completed` and `skipped` are terminal. `failed` is terminal only once the
//! retry budget is spent. The helpers on [`ReviewJob`] are the only way the
//! server mutates status, so the score/status invariant holds by construction:
//! a score is present if and only if the job is `completed`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Newtype for job row identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Lifecycle state of a review job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Analyzing,
    Completed,
    Failed,
    Skipped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Analyzing => "analyzing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Whether the job will not change again without operator action.
    ///
    /// `failed` counts as terminal here: the retry sweep may still pick it up,
    /// but nothing in the normal execution path will.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "analyzing" => Ok(Self::Analyzing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Which kind of repository event produced the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventType {
    Push,
    MergeRequest,
}

impl JobEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::MergeRequest => "merge_request",
        }
    }
}

impl fmt::Display for JobEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(Self::Push),
            // GitHub calls them pull requests; both spellings land here.
            "merge_request" | "pull_request" => Ok(Self::MergeRequest),
            other => Err(format!("unknown event type '{}'", other)),
        }
    }
}

/// Commit author as reported by the hosting platform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
    pub profile_url: Option<String>,
}

/// Merge/pull request details, present only for `merge_request` jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRequestRef {
    pub number: u64,
    pub url: Option<String>,
    pub target_branch: Option<String>,
}

/// Counters summarising the change a job reviews.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeStats {
    pub files_changed: u32,
    pub additions: u32,
    pub deletions: u32,
}

/// Everything known about a job before it is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub project_id: i64,
    pub commit_hash: String,
    /// Parent of the reviewed range, used to fetch the diff for pushes.
    pub base_commit: Option<String>,
    pub event_type: JobEventType,
    pub branch: String,
    pub author: Author,
    pub commit_message: String,
    pub merge_request: Option<MergeRequestRef>,
    /// Diff text when the caller already has it (synchronous endpoint).
    pub diff: Option<String>,
    pub stats: ChangeStats,
}

/// A persisted review job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewJob {
    pub id: JobId,
    pub project_id: i64,
    pub commit_hash: String,
    pub base_commit: Option<String>,
    pub event_type: JobEventType,
    pub branch: String,
    pub author: Author,
    pub commit_message: String,
    pub merge_request: Option<MergeRequestRef>,
    pub diff: Option<String>,
    pub stats: ChangeStats,
    pub status: JobStatus,
    pub score: Option<f64>,
    pub review_result: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReviewJob {
    /// Materialise a freshly inserted job at `pending`.
    pub fn from_new(id: JobId, new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            project_id: new.project_id,
            commit_hash: new.commit_hash,
            base_commit: new.base_commit,
            event_type: new.event_type,
            branch: new.branch,
            author: new.author,
            commit_message: new.commit_message,
            merge_request: new.merge_request,
            diff: new.diff,
            stats: new.stats,
            status: JobStatus::Pending,
            score: None,
            review_result: None,
            error_message: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn short_commit(&self) -> &str {
        crate::abbreviate(&self.commit_hash, 7)
    }

    pub fn mark_analyzing(&mut self) {
        self.status = JobStatus::Analyzing;
        self.score = None;
        self.error_message = None;
        self.touch();
    }

    pub fn mark_completed(&mut self, score: f64, review: String) {
        self.status = JobStatus::Completed;
        self.score = Some(score);
        self.review_result = Some(review);
        self.error_message = None;
        self.touch();
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.score = None;
        self.error_message = Some(error.into());
        self.touch();
    }

    pub fn mark_skipped(&mut self, reason: impl Into<String>) {
        self.status = JobStatus::Skipped;
        self.score = None;
        self.review_result = Some(reason.into());
        self.error_message = None;
        self.touch();
    }

    /// Flip a failed job back to `pending` for another attempt.
    ///
    /// `retry_count` only ever grows; manual and automated retries both count.
    pub fn begin_retry(&mut self) {
        self.retry_count = self.retry_count.saturating_add(1);
        self.status = JobStatus::Pending;
        self.score = None;
        self.touch();
    }

    /// Whether the automated retry sweep may still pick this job up.
    pub fn is_retryable(&self, max_attempts: u32) -> bool {
        self.status == JobStatus::Failed && self.retry_count < max_attempts
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
pub(crate) fn sample_new_job(project_id: i64, commit: &str) -> NewJob {
    NewJob {
        project_id,
        commit_hash: commit.to_string(),
        base_commit: None,
        event_type: JobEventType::Push,
        branch: "main".to_string(),
        author: Author {
            name: "Jane Doe".to_string(),
            ..Author::default()
        },
        commit_message: "Fix the thing".to_string(),
        merge_request: None,
        diff: None,
        stats: ChangeStats::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> ReviewJob {
        ReviewJob::from_new(JobId(1), sample_new_job(7, "abcdef1234567"), Utc::now())
    }

    #[test]
    fn test_new_job_starts_pending_without_score() {
        let job = job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.score, None);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.short_commit(), "abcdef1");
    }

    #[test]
    fn test_short_commit_tolerates_non_ascii_hash() {
        let mut job = job();
        job.commit_hash = "ça-vä-bien".to_string();
        assert_eq!(job.short_commit(), "ça-vä-b");
        job.commit_hash = "ü".to_string();
        assert_eq!(job.short_commit(), "ü");
    }

    #[test]
    fn test_score_only_present_when_completed() {
        let mut job = job();
        job.mark_analyzing();
        assert!(job.score.is_none());

        job.mark_completed(72.0, "Looks fine".to_string());
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.score, Some(72.0));

        job.mark_failed("boom");
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.score.is_none());
        assert_eq!(job.error_message.as_deref(), Some("boom"));

        job.mark_skipped("nothing to review");
        assert!(job.score.is_none());
    }

    #[test]
    fn test_begin_retry_increments_and_resets_status() {
        let mut job = job();
        job.mark_failed("timeout");
        assert!(job.is_retryable(3));

        job.begin_retry();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 1);
        assert!(!job.is_retryable(3), "pending jobs are not retryable");
    }

    #[test]
    fn test_retry_cap() {
        let mut job = job();
        for _ in 0..3 {
            job.mark_failed("still broken");
            job.begin_retry();
        }
        job.mark_failed("still broken");
        assert_eq!(job.retry_count, 3);
        assert!(!job.is_retryable(3));
    }

    #[test]
    fn test_skipped_is_never_retryable() {
        let mut job = job();
        job.mark_skipped("empty diff");
        assert!(!job.is_retryable(u32::MAX));
        assert!(job.status.is_terminal());
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Analyzing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Skipped,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>(), Ok(status));
        }
        assert!("done".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_event_type_accepts_pull_request_alias() {
        assert_eq!(
            "pull_request".parse::<JobEventType>(),
            Ok(JobEventType::MergeRequest)
        );
        assert_eq!("push".parse::<JobEventType>(), Ok(JobEventType::Push));
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&JobStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
    }
}
