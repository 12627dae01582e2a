//! GitLab system and project hook payloads.

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
        "Push Hook" => Ok(Decoded::Event(Box::new(PlatformEvent::GitLabPush(parse(body)?)))),
        "Merge Request Hook" => Ok(Decoded::Event(Box::new(
            PlatformEvent::GitLabMergeRequest(parse(body)?),
        ))),
        "Tag Push Hook" => Ok(Decoded::Ignored("tag push".to_string())),
        other => Err(IngestError::UnsupportedEvent(other.to_string())),
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Project {
    #[serde(default)]
    pub web_url: String,
    #[serde(default)]
    pub git_http_url: String,
    #[serde(default)]
    pub path_with_namespace: String,
}

impl Project {
    pub(super) fn urls(&self) -> Vec<&str> {
        vec![self.web_url.as_str(), self.git_http_url.as_str()]
    }
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
    #[serde(default)]
    pub before: String,
    #[serde(default)]
    pub after: String,
    #[serde(rename = "ref")]
    pub ref_name: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub user_email: Option<String>,
    #[serde(default)]
    pub user_avatar: Option<String>,
    #[serde(default)]
    pub project: Project,
    /// Oldest first.
    #[serde(default)]
    pub commits: Vec<Commit>,
}

impl PushEvent {
    pub(super) fn normalize(&self, project_id: i64) -> Result<Normalized, IngestError> {
        if real_sha(&self.after).is_none() {
            return Ok(Normalized::Ignored("branch deleted".to_string()));
        }
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

        let author = if last.author.name.is_empty() {
            Author {
                name: self.user_name.clone(),
                email: self.user_email.clone(),
                avatar_url: self.user_avatar.clone(),
                profile_url: None,
            }
        } else {
            Author {
                name: last.author.name.clone(),
                email: last.author.email.clone(),
                avatar_url: self.user_avatar.clone(),
                profile_url: None,
            }
        };

        Ok(Normalized::Job(Box::new(NewJob {
            project_id,
            commit_hash,
            base_commit: real_sha(&self.before),
            event_type: JobEventType::Push,
            branch: branch_from_ref(&self.ref_name).to_string(),
            author,
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

#[derive(Debug, Clone, Default, Deserialize)]
pub struct User {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LastCommit {
    pub id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub author: CommitAuthor,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MergeRequestAttributes {
    pub iid: u64,
    #[serde(default)]
    pub url: Option<String>,
    pub source_branch: String,
    pub target_branch: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    /// Present on `update` only when new commits were pushed.
    #[serde(default)]
    pub oldrev: Option<String>,
    pub last_commit: Option<LastCommit>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MergeRequestEvent {
    #[serde(default)]
    pub user: User,
    #[serde(default)]
    pub project: Project,
    pub object_attributes: MergeRequestAttributes,
}

impl MergeRequestEvent {
    pub(super) fn normalize(&self, project_id: i64) -> Result<Normalized, IngestError> {
        let attrs = &self.object_attributes;
        let action = attrs.action.as_deref().unwrap_or("");
        let reviewable = match action {
            "open" | "reopen" => true,
            "update" => attrs.oldrev.as_deref().and_then(real_sha).is_some(),
            _ => false,
        };
        if !reviewable {
            return Ok(Normalized::Ignored(format!(
                "merge request action '{}' needs no review",
                action
            )));
        }

        let last = attrs
            .last_commit
            .as_ref()
            .ok_or_else(|| IngestError::InvalidPayload("missing last_commit".to_string()))?;
        let commit_hash = require_sha(&last.id, "last_commit.id")?;

        let name = if last.author.name.is_empty() {
            self.user.name.clone()
        } else {
            last.author.name.clone()
        };

        let mut message = attrs.title.trim().to_string();
        if let Some(description) = attrs.description.as_deref().map(str::trim) {
            if !description.is_empty() {
                message.push_str("\n\n");
                message.push_str(description);
            }
        }

        Ok(Normalized::Job(Box::new(NewJob {
            project_id,
            commit_hash,
            base_commit: None,
            event_type: JobEventType::MergeRequest,
            branch: attrs.source_branch.clone(),
            author: Author {
                name,
                email: last.author.email.clone().or_else(|| self.user.email.clone()),
                avatar_url: self.user.avatar_url.clone(),
                profile_url: None,
            },
            commit_message: message,
            merge_request: Some(MergeRequestRef {
                number: attrs.iid,
                url: attrs.url.clone(),
                target_branch: Some(attrs.target_branch.clone()),
            }),
            diff: None,
            stats: ChangeStats::default(),
        })))
    }
}
