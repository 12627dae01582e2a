//! Git hosting platforms and their webhook payloads.
//!
//! Each platform's payloads are decoded into a [`PlatformEvent`] variant
//! and then normalised into the one canonical [`NewJob`] shape.

pub mod bitbucket;
pub mod github;
pub mod gitlab;

use std::fmt;
use std::str::FromStr;

use axum::http::HeaderMap;
use revhook_core::{JobEventType, NewJob};
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

/// A 40-zero SHA marks a created or deleted ref in push payloads.
pub const ZERO_SHA: &str = "0000000000000000000000000000000000000000";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    GitLab,
    GitHub,
    Bitbucket,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GitLab => "gitlab",
            Self::GitHub => "github",
            Self::Bitbucket => "bitbucket",
        }
    }

    /// Header carrying the event name.
    pub fn event_header(&self) -> &'static str {
        match self {
            Self::GitLab => "x-gitlab-event",
            Self::GitHub => "x-github-event",
            Self::Bitbucket => "x-event-key",
        }
    }

    /// Guess the sender from its event header.
    pub fn detect(headers: &HeaderMap) -> Option<Self> {
        [Self::GitLab, Self::GitHub, Self::Bitbucket]
            .into_iter()
            .find(|p| headers.contains_key(p.event_header()))
    }

    pub fn event_name(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get(self.event_header())
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gitlab" => Ok(Self::GitLab),
            "github" => Ok(Self::GitHub),
            "bitbucket" => Ok(Self::Bitbucket),
            other => Err(format!("unknown platform '{}'", other)),
        }
    }
}

/// A decoded webhook payload.
#[derive(Debug, Clone)]
pub enum PlatformEvent {
    GitLabPush(gitlab::PushEvent),
    GitLabMergeRequest(gitlab::MergeRequestEvent),
    GitHubPush(github::PushEvent),
    GitHubPullRequest(github::PullRequestEvent),
    BitbucketPush(bitbucket::PushEvent),
    BitbucketPullRequest(bitbucket::PullRequestEvent),
}

/// What decoding produced.
#[derive(Debug, Clone)]
pub enum Decoded {
    Event(Box<PlatformEvent>),
    /// A well-formed event that never produces a job (pings, tag pushes).
    Ignored(String),
}

/// What normalisation produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Job(Box<NewJob>),
    Ignored(String),
}

pub(crate) fn parse<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, IngestError> {
    serde_json::from_slice(body).map_err(|e| IngestError::InvalidPayload(e.to_string()))
}

impl PlatformEvent {
    /// Decode `body` according to the platform's event name.
    pub fn decode(
        platform: Platform,
        event_name: &str,
        body: &[u8],
    ) -> Result<Decoded, IngestError> {
        match platform {
            Platform::GitLab => gitlab::decode(event_name, body),
            Platform::GitHub => github::decode(event_name, body),
            Platform::Bitbucket => bitbucket::decode(event_name, body),
        }
    }

    pub fn platform(&self) -> Platform {
        match self {
            Self::GitLabPush(_) | Self::GitLabMergeRequest(_) => Platform::GitLab,
            Self::GitHubPush(_) | Self::GitHubPullRequest(_) => Platform::GitHub,
            Self::BitbucketPush(_) | Self::BitbucketPullRequest(_) => Platform::Bitbucket,
        }
    }

    pub fn event_type(&self) -> JobEventType {
        match self {
            Self::GitLabPush(_) | Self::GitHubPush(_) | Self::BitbucketPush(_) => {
                JobEventType::Push
            }
            _ => JobEventType::MergeRequest,
        }
    }

    /// Repository URLs found in the payload, for resolving the project.
    pub fn repository_urls(&self) -> Vec<&str> {
        let urls = match self {
            Self::GitLabPush(e) => e.project.urls(),
            Self::GitLabMergeRequest(e) => e.project.urls(),
            Self::GitHubPush(e) => e.repository.urls(),
            Self::GitHubPullRequest(e) => e.repository.urls(),
            Self::BitbucketPush(e) => e.repository.urls(),
            Self::BitbucketPullRequest(e) => e.repository.urls(),
        };
        urls.into_iter().filter(|u| !u.is_empty()).collect()
    }

    /// Branches a project's ignore-list is checked against.
    ///
    /// For merge requests both the source and the target count.
    pub fn branches(&self) -> Vec<&str> {
        match self {
            Self::GitLabPush(e) => vec![branch_from_ref(&e.ref_name)],
            Self::GitHubPush(e) => vec![branch_from_ref(&e.ref_name)],
            Self::BitbucketPush(e) => e.branch().into_iter().collect(),
            Self::GitLabMergeRequest(e) => vec![
                e.object_attributes.source_branch.as_str(),
                e.object_attributes.target_branch.as_str(),
            ],
            Self::GitHubPullRequest(e) => vec![
                e.pull_request.head.ref_name.as_str(),
                e.pull_request.base.ref_name.as_str(),
            ],
            Self::BitbucketPullRequest(e) => vec![
                e.pullrequest.source.branch.name.as_str(),
                e.pullrequest.destination.branch.name.as_str(),
            ],
        }
    }

    pub fn normalize(&self, project_id: i64) -> Result<Normalized, IngestError> {
        match self {
            Self::GitLabPush(e) => e.normalize(project_id),
            Self::GitLabMergeRequest(e) => e.normalize(project_id),
            Self::GitHubPush(e) => e.normalize(project_id),
            Self::GitHubPullRequest(e) => e.normalize(project_id),
            Self::BitbucketPush(e) => e.normalize(project_id),
            Self::BitbucketPullRequest(e) => e.normalize(project_id),
        }
    }
}

/// `refs/heads/main` -> `main`. Other refs are returned unchanged.
pub fn branch_from_ref(ref_name: &str) -> &str {
    ref_name.strip_prefix("refs/heads/").unwrap_or(ref_name)
}

/// `None` for a missing or all-zero SHA.
pub(crate) fn real_sha(sha: &str) -> Option<String> {
    let sha = sha.trim();
    if sha.is_empty() || sha.bytes().all(|b| b == b'0') {
        None
    } else {
        Some(sha.to_string())
    }
}

/// Join commit messages oldest first, one block per commit.
pub(crate) fn join_messages<'a>(messages: impl IntoIterator<Item = &'a str>) -> String {
    messages
        .into_iter()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub(crate) fn require_sha(sha: &str, what: &str) -> Result<String, IngestError> {
    real_sha(sha).ok_or_else(|| IngestError::InvalidPayload(format!("missing {}", what)))
}
