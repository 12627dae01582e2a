//! GitHub webhook payloads.

use revhook_core::{Author, ChangeStats, JobEventType, MergeRequestRef, NewJob};
use serde::Deserialize;
use std::collections::BTreeSet;

use super::{
    branch_from_ref, join_messages, parse, real_sha, require_sha, Decoded, Normalized,
    PlatformEvent,
};
use crate::error::IngestError;

pub(super) fn decode(event_name: &str, body: &[u8]) -> Result<Decoded, IngestError> {
    match event_name {
        "push" => Ok(Decoded::Event(Box::new(PlatformEvent::GitHubPush(parse(body)?)))),
        "pull_request" => Ok(Decoded::Event(Box::new(PlatformEvent::GitHubPullRequest(
            parse(body)?,
        )))),
        // Sent once when the hook is created.
        "ping" => Ok(Decoded::Ignored("ping".to_string())),
        other => Err(IngestError::UnsupportedEvent(other.to_string())),
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Repository {
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub clone_url: String,
}

impl Repository {
    pub(super) fn urls(&self) -> Vec<&str> {
        vec![
            self.html_url.as_str(),
            self.url.as_str(),
            self.clone_url.as_str(),
        ]
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct User {
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommitAuthor {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Commit {
    pub id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub author: CommitAuthor,
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default)]
    pub modified: Vec<String>,
    #[serde(default)]
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "ref")]
    pub ref_name: String,
    #[serde(default)]
    pub before: String,
    #[serde(default)]
    pub after: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub repository: Repository,
    #[serde(default)]
    pub sender: User,
    /// Oldest first.
    #[serde(default)]
    pub commits: Vec<Commit>,
    #[serde(default)]
    pub head_commit: Option<Commit>,
}

impl PushEvent {
    pub(super) fn normalize(&self, project_id: i64) -> Result<Normalized, IngestError> {
        if self.deleted || real_sha(&self.after).is_none() {
            return Ok(Normalized::Ignored("branch deleted".to_string()));
        }
        // A push of already-known commits carries only head_commit: nothing new.
        let Some(last) = self.commits.last() else {
            return Ok(Normalized::Ignored("push contains no commits".to_string()));
        };
        let commit_hash = require_sha(&last.id, "commit id")?;

        let touched: BTreeSet<&str> = self
            .commits
            .iter()
            .flat_map(|c| c.added.iter().chain(&c.modified).chain(&c.removed))
            .map(String::as_str)
            .collect();

        let name = if last.author.name.is_empty() {
            self.sender.login.clone()
        } else {
            last.author.name.clone()
        };

        Ok(Normalized::Job(Box::new(NewJob {
            project_id,
            commit_hash,
            base_commit: real_sha(&self.before),
            event_type: JobEventType::Push,
            branch: branch_from_ref(&self.ref_name).to_string(),
            author: Author {
                name,
                email: last.author.email.clone(),
                avatar_url: self.sender.avatar_url.clone(),
                profile_url: self.sender.html_url.clone(),
            },
            commit_message: join_messages(self.commits.iter().map(|c| c.message.as_str())),
            merge_request: None,
            diff: None,
            stats: ChangeStats {
                files_changed: touched.len() as u32,
                ..ChangeStats::default()
            },
        })))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestRef {
    pub sha: String,
    #[serde(rename = "ref")]
    pub ref_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    pub head: PullRequestRef,
    pub base: PullRequestRef,
    #[serde(default)]
    pub user: User,
    #[serde(default)]
    pub changed_files: Option<u32>,
    #[serde(default)]
    pub additions: Option<u32>,
    #[serde(default)]
    pub deletions: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestEvent {
    pub action: String,
    pub pull_request: PullRequest,
    #[serde(default)]
    pub repository: Repository,
}

impl PullRequestEvent {
    pub(super) fn normalize(&self, project_id: i64) -> Result<Normalized, IngestError> {
        if !matches!(self.action.as_str(), "opened" | "reopened" | "synchronize") {
            return Ok(Normalized::Ignored(format!(
                "pull request action '{}' needs no review",
                self.action
            )));
        }
        let pr = &self.pull_request;
        let commit_hash = require_sha(&pr.head.sha, "pull_request.head.sha")?;

        let mut message = pr.title.trim().to_string();
        if let Some(body) = pr.body.as_deref().map(str::trim) {
            if !body.is_empty() {
                message.push_str("\n\n");
                message.push_str(body);
            }
        }

        Ok(Normalized::Job(Box::new(NewJob {
            project_id,
            commit_hash,
            base_commit: real_sha(&pr.base.sha),
            event_type: JobEventType::MergeRequest,
            branch: pr.head.ref_name.clone(),
            author: Author {
                name: pr.user.login.clone(),
                email: None,
                avatar_url: pr.user.avatar_url.clone(),
                profile_url: pr.user.html_url.clone(),
            },
            commit_message: message,
            merge_request: Some(MergeRequestRef {
                number: pr.number,
                url: pr.html_url.clone(),
                target_branch: Some(pr.base.ref_name.clone()),
            }),
            diff: None,
            stats: ChangeStats {
                files_changed: pr.changed_files.unwrap_or(0),
                additions: pr.additions.unwrap_or(0),
                deletions: pr.deletions.unwrap_or(0),
            },
        })))
    }
}
