//! Bitbucket Cloud webhook payloads.

use revhook_core::{Author, ChangeStats, JobEventType, MergeRequestRef, NewJob};
use serde::Deserialize;

use super::{join_messages, parse, real_sha, require_sha, Decoded, Normalized, PlatformEvent};
use crate::error::IngestError;

pub(super) fn decode(event_name: &str, body: &[u8]) -> Result<Decoded, IngestError> {
    match event_name {
        "repo:push" => Ok(Decoded::Event(Box::new(PlatformEvent::BitbucketPush(parse(body)?)))),
        "pullrequest:created" | "pullrequest:updated" => Ok(Decoded::Event(Box::new(
            PlatformEvent::BitbucketPullRequest(parse(body)?),
        ))),
        "pullrequest:fulfilled" | "pullrequest:rejected" | "pullrequest:approved"
        | "pullrequest:unapproved" | "pullrequest:comment_created" => {
            Ok(Decoded::Ignored(format!("{} needs no review", event_name)))
        }
        "diagnostics:ping" => Ok(Decoded::Ignored("ping".to_string())),
        other => Err(IngestError::UnsupportedEvent(other.to_string())),
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Link {
    #[serde(default)]
    pub href: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Links {
    #[serde(default)]
    pub html: Option<Link>,
    #[serde(default)]
    pub avatar: Option<Link>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Repository {
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub links: Links,
}

impl Repository {
    pub(super) fn urls(&self) -> Vec<&str> {
        self.links
            .html
            .as_ref()
            .map(|l| l.href.as_str())
            .into_iter()
            .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Account {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub links: Links,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommitAuthor {
    /// `Name <email>` as recorded in the commit.
    #[serde(default)]
    pub raw: String,
    #[serde(default)]
    pub user: Option<Account>,
}

impl CommitAuthor {
    fn split(&self) -> (String, Option<String>) {
        match self.raw.split_once('<') {
            Some((name, rest)) => {
                let email = rest.trim_end_matches('>').trim();
                (
                    name.trim().to_string(),
                    (!email.is_empty()).then(|| email.to_string()),
                )
            }
            None => (self.raw.trim().to_string(), None),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Commit {
    pub hash: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub author: CommitAuthor,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefState {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub name: String,
    pub target: Commit,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Change {
    pub new: Option<RefState>,
    pub old: Option<RefState>,
    /// Newest first, truncated by Bitbucket.
    #[serde(default)]
    pub commits: Vec<Commit>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Push {
    #[serde(default)]
    pub changes: Vec<Change>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushEvent {
    #[serde(default)]
    pub push: Push,
    #[serde(default)]
    pub repository: Repository,
    #[serde(default)]
    pub actor: Account,
}

impl PushEvent {
    /// First change that moved a branch forward.
    fn branch_change(&self) -> Option<(&Change, &RefState)> {
        self.push.changes.iter().find_map(|change| {
            change
                .new
                .as_ref()
                .filter(|new| new.kind.is_empty() || new.kind == "branch")
                .map(|new| (change, new))
        })
    }

    pub(super) fn branch(&self) -> Option<&str> {
        self.branch_change().map(|(_, new)| new.name.as_str())
    }

    pub(super) fn normalize(&self, project_id: i64) -> Result<Normalized, IngestError> {
        let Some((change, new)) = self.branch_change() else {
            return Ok(Normalized::Ignored("branch deleted".to_string()));
        };
        let commit_hash = require_sha(&new.target.hash, "new.target.hash")?;

        let messages: Vec<&str> = if change.commits.is_empty() {
            vec![new.target.message.as_str()]
        } else {
            change.commits.iter().rev().map(|c| c.message.as_str()).collect()
        };

        let (name, email) = new.target.author.split();
        let account = new.target.author.user.as_ref().unwrap_or(&self.actor);

        Ok(Normalized::Job(Box::new(NewJob {
            project_id,
            commit_hash,
            base_commit: change.old.as_ref().and_then(|old| real_sha(&old.target.hash)),
            event_type: JobEventType::Push,
            branch: new.name.clone(),
            author: Author {
                name: if name.is_empty() {
                    account.display_name.clone()
                } else {
                    name
                },
                email,
                avatar_url: account.links.avatar.as_ref().map(|l| l.href.clone()),
                profile_url: account.links.html.as_ref().map(|l| l.href.clone()),
            },
            commit_message: join_messages(messages),
            merge_request: None,
            diff: None,
            stats: ChangeStats::default(),
        })))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BranchName {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitRef {
    pub hash: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Endpoint {
    pub branch: BranchName,
    pub commit: Option<CommitRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    pub id: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub links: Links,
    pub source: Endpoint,
    pub destination: Endpoint,
    #[serde(default)]
    pub author: Account,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestEvent {
    pub pullrequest: PullRequest,
    #[serde(default)]
    pub repository: Repository,
}

impl PullRequestEvent {
    pub(super) fn normalize(&self, project_id: i64) -> Result<Normalized, IngestError> {
        let pr = &self.pullrequest;
        let head = pr
            .source
            .commit
            .as_ref()
            .map(|c| c.hash.as_str())
            .unwrap_or("");
        let commit_hash = require_sha(head, "pullrequest.source.commit.hash")?;

        let mut message = pr.title.trim().to_string();
        if let Some(description) = pr.description.as_deref().map(str::trim) {
            if !description.is_empty() {
                message.push_str("\n\n");
                message.push_str(description);
            }
        }

        Ok(Normalized::Job(Box::new(NewJob {
            project_id,
            commit_hash,
            base_commit: pr
                .destination
                .commit
                .as_ref()
                .and_then(|c| real_sha(&c.hash)),
            event_type: JobEventType::MergeRequest,
            branch: pr.source.branch.name.clone(),
            author: Author {
                name: pr.author.display_name.clone(),
                email: None,
                avatar_url: pr.author.links.avatar.as_ref().map(|l| l.href.clone()),
                profile_url: pr.author.links.html.as_ref().map(|l| l.href.clone()),
            },
            commit_message: message,
            merge_request: Some(MergeRequestRef {
                number: pr.id,
                url: pr.links.html.as_ref().map(|l| l.href.clone()),
                target_branch: Some(pr.destination.branch.name.clone()),
            }),
            diff: None,
            stats: ChangeStats::default(),
        })))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use serde_json::json;

    pub fn push(new_hash: &str, branch: &str) -> serde_json::Value {
        json!({
            "actor": {"display_name": "Lin", "links": {"avatar": {"href": "https://bb/avatar"}}},
            "repository": {
                "full_name": "team/service",
                "links": {"html": {"href": "https://bitbucket.org/team/service"}}
            },
            "push": {"changes": [{
                "new": {"type": "branch", "name": branch, "target": {
                    "hash": new_hash, "message": "second\n", "author": {"raw": "Lin Chen <lin@example.com>"}
                }},
                "old": {"type": "branch", "name": branch, "target": {
                    "hash": "5555555555555555555555555555555555555555", "message": "base", "author": {"raw": "x"}
                }},
                "commits": [
                    {"hash": new_hash, "message": "second\n", "author": {"raw": "Lin Chen <lin@example.com>"}},
                    {"hash": "6666666666666666666666666666666666666666", "message": "first\n", "author": {"raw": "Lin Chen <lin@example.com>"}}
                ]
            }]}
        })
    }

    pub fn pull_request(head: &str) -> serde_json::Value {
        json!({
            "pullrequest": {
                "id": 8,
                "title": "Tidy config",
                "links": {"html": {"href": "https://bitbucket.org/team/service/pull-requests/8"}},
                "source": {"branch": {"name": "chore/config"}, "commit": {"hash": head}},
                "destination": {"branch": {"name": "main"}, "commit": {"hash": "7777777777777777777777777777777777777777"}},
                "author": {"display_name": "Lin"}
            },
            "repository": {"links": {"html": {"href": "https://bitbucket.org/team/service"}}}
        })
    }
}
