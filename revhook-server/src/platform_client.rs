//! Outbound calls to the hosting platforms' REST APIs.
//!
//! Fetching diffs and file contents, setting commit statuses, and posting
//! review comments. Each platform speaks its own dialect; everything is
//! addressed through the project's repository path and access token.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use revhook_core::ReviewJob;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::platform::Platform;
use crate::projects::Project;

/// Name under which statuses and checks appear on the platform.
pub const STATUS_CONTEXT: &str = "revhook";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    Pending,
    Success,
    Failure,
}

impl CommitState {
    fn github(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }

    fn gitlab(&self) -> &'static str {
        match self {
            Self::Pending => "running",
            Self::Success => "success",
            Self::Failure => "failed",
        }
    }

    fn bitbucket(&self) -> &'static str {
        match self {
            Self::Pending => "INPROGRESS",
            Self::Success => "SUCCESSFUL",
            Self::Failure => "FAILED",
        }
    }
}

#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Unified diff for the job's change.
    async fn fetch_diff(&self, project: &Project, job: &ReviewJob) -> Result<String>;

    /// File contents at `commit`, or `None` when it does not exist there.
    async fn fetch_file(&self, project: &Project, commit: &str, path: &str)
        -> Result<Option<String>>;

    async fn set_commit_status(
        &self,
        project: &Project,
        job: &ReviewJob,
        state: CommitState,
        description: &str,
    ) -> Result<()>;

    /// Comment on the merge request, or on the commit for pushes.
    async fn post_comment(&self, project: &Project, job: &ReviewJob, body: &str) -> Result<()>;
}

/// One entry of GitLab's `changes`/`diffs` arrays.
#[derive(Debug, Clone, Deserialize)]
pub struct GitLabDiff {
    pub old_path: String,
    pub new_path: String,
    #[serde(default)]
    pub diff: String,
    #[serde(default)]
    pub new_file: bool,
    #[serde(default)]
    pub deleted_file: bool,
}

#[derive(Debug, Deserialize)]
struct GitLabChanges {
    changes: Vec<GitLabDiff>,
}

#[derive(Debug, Deserialize)]
struct GitLabCompare {
    diffs: Vec<GitLabDiff>,
}

/// GitLab returns hunks without file headers; rebuild a unified diff.
pub fn gitlab_to_unified(diffs: &[GitLabDiff]) -> String {
    let mut out = String::new();
    for d in diffs {
        out.push_str(&format!("diff --git a/{} b/{}\n", d.old_path, d.new_path));
        if d.new_file {
            out.push_str("--- /dev/null\n");
        } else {
            out.push_str(&format!("--- a/{}\n", d.old_path));
        }
        if d.deleted_file {
            out.push_str("+++ /dev/null\n");
        } else {
            out.push_str(&format!("+++ b/{}\n", d.new_path));
        }
        out.push_str(&d.diff);
        if !d.diff.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

/// REST client for all three platforms.
pub struct HttpPlatformClient {
    client: Client,
}

impl HttpPlatformClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// API root for a project: explicit `api_url`, else the platform default.
    pub fn api_base(project: &Project) -> String {
        if let Some(api) = project.api_url.as_deref().filter(|s| !s.trim().is_empty()) {
            return api.trim_end_matches('/').to_string();
        }
        match project.platform {
            Platform::GitHub => "https://api.github.com".to_string(),
            Platform::GitLab => format!("{}/api/v4", project.origin()),
            Platform::Bitbucket => "https://api.bitbucket.org/2.0".to_string(),
        }
    }

    /// Build an API URL from raw path segments, percent-encoding each.
    ///
    /// GitLab addresses a project by its full path as a single segment, so
    /// `team/app` must travel as `team%2Fapp`.
    pub fn api_url(project: &Project, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&Self::api_base(project))
            .with_context(|| format!("Invalid API URL for project {}", project.id))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("API URL for project {} cannot be a base", project.id))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Repository path split into URL segments (`owner`, `repo`).
    fn repo_segments(project: &Project) -> Vec<String> {
        project.repo_path().split('/').map(str::to_string).collect()
    }

    fn authorize(&self, project: &Project, request: RequestBuilder) -> RequestBuilder {
        let request = request.header("User-Agent", concat!("revhook/", env!("CARGO_PKG_VERSION")));
        match (project.platform, project.access_token.as_deref()) {
            (_, None) => request,
            (Platform::GitLab, Some(token)) => request.header("PRIVATE-TOKEN", token),
            (_, Some(token)) => request.bearer_auth(token),
        }
    }

    async fn check(response: Response, what: &str) -> Result<Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let error_text = response
            .text()
            .await
            .context("Failed to read error response body")?;
        bail!("{} failed: {} - {}", what, status, error_text)
    }

    async fn get_text(
        &self,
        project: &Project,
        url: Url,
        accept: &str,
        what: &str,
    ) -> Result<String> {
        debug!(url = %url, "GET {}", what);
        let response = self
            .authorize(project, self.client.get(url))
            .header("Accept", accept)
            .send()
            .await
            .with_context(|| format!("Failed to send {} request", what))?;
        Self::check(response, what)
            .await?
            .text()
            .await
            .with_context(|| format!("Failed to read {} response", what))
    }

    async fn post_json(
        &self,
        project: &Project,
        url: Url,
        body: serde_json::Value,
        what: &str,
    ) -> Result<()> {
        let response = self
            .authorize(project, self.client.post(url))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to send {} request", what))?;
        Self::check(response, what).await?;
        Ok(())
    }

    fn segments<'a>(prefix: &[&'a str], repo: &'a [String], rest: &[&'a str]) -> Vec<&'a str> {
        prefix
            .iter()
            .copied()
            .chain(repo.iter().map(String::as_str))
            .chain(rest.iter().copied())
            .collect()
    }
}

#[async_trait]
impl PlatformClient for HttpPlatformClient {
    async fn fetch_diff(&self, project: &Project, job: &ReviewJob) -> Result<String> {
        let repo = Self::repo_segments(project);
        let repo_path = project.repo_path();
        let head = job.commit_hash.as_str();
        let mr = job.merge_request.as_ref().map(|m| m.number.to_string());

        let diff = match project.platform {
            Platform::GitHub => {
                let url = match (mr.as_deref(), job.base_commit.as_deref()) {
                    (Some(number), _) => Self::api_url(
                        project,
                        &Self::segments(&["repos"], &repo, &["pulls", number]),
                    )?,
                    (None, Some(base)) => {
                        let range = format!("{}...{}", base, head);
                        Self::api_url(
                            project,
                            &Self::segments(&["repos"], &repo, &["compare", range.as_str()]),
                        )?
                    }
                    (None, None) => Self::api_url(
                        project,
                        &Self::segments(&["repos"], &repo, &["commits", head]),
                    )?,
                };
                self.get_text(project, url, "application/vnd.github.v3.diff", "diff")
                    .await?
            }
            Platform::GitLab => {
                let base_url = ["projects", repo_path.as_str()];
                let diffs = match (mr.as_deref(), job.base_commit.as_deref()) {
                    (Some(iid), _) => {
                        let mut url = Self::api_url(project, &base_url)?;
                        url.path_segments_mut()
                            .map_err(|_| anyhow!("invalid GitLab URL"))?
                            .extend(["merge_requests", iid, "changes"]);
                        let raw = self.get_text(project, url, "application/json", "diff").await?;
                        serde_json::from_str::<GitLabChanges>(&raw)
                            .context("Failed to parse GitLab merge request changes")?
                            .changes
                    }
                    (None, Some(base)) => {
                        let mut url = Self::api_url(project, &base_url)?;
                        url.path_segments_mut()
                            .map_err(|_| anyhow!("invalid GitLab URL"))?
                            .extend(["repository", "compare"]);
                        url.query_pairs_mut()
                            .append_pair("from", base)
                            .append_pair("to", head);
                        let raw = self.get_text(project, url, "application/json", "diff").await?;
                        serde_json::from_str::<GitLabCompare>(&raw)
                            .context("Failed to parse GitLab compare")?
                            .diffs
                    }
                    (None, None) => {
                        let mut url = Self::api_url(project, &base_url)?;
                        url.path_segments_mut()
                            .map_err(|_| anyhow!("invalid GitLab URL"))?
                            .extend(["repository", "commits", head, "diff"]);
                        let raw = self.get_text(project, url, "application/json", "diff").await?;
                        serde_json::from_str::<Vec<GitLabDiff>>(&raw)
                            .context("Failed to parse GitLab commit diff")?
                    }
                };
                gitlab_to_unified(&diffs)
            }
            Platform::Bitbucket => {
                let url = match (mr.as_deref(), job.base_commit.as_deref()) {
                    (Some(id), _) => Self::api_url(
                        project,
                        &Self::segments(&["repositories"], &repo, &["pullrequests", id, "diff"]),
                    )?,
                    (None, Some(base)) => {
                        let spec = format!("{}..{}", head, base);
                        Self::api_url(
                            project,
                            &Self::segments(&["repositories"], &repo, &["diff", spec.as_str()]),
                        )?
                    }
                    (None, None) => Self::api_url(
                        project,
                        &Self::segments(&["repositories"], &repo, &["diff", head]),
                    )?,
                };
                self.get_text(project, url, "text/plain", "diff").await?
            }
        };

        info!(job_id = %job.id, bytes = diff.len(), "Fetched diff");
        Ok(diff)
    }

    async fn fetch_file(
        &self,
        project: &Project,
        commit: &str,
        path: &str,
    ) -> Result<Option<String>> {
        let repo = Self::repo_segments(project);
        let repo_path = project.repo_path();
        let file_segments: Vec<&str> = path.split('/').collect();

        let (url, accept) = match project.platform {
            Platform::GitHub => {
                let mut segments = Self::segments(&["repos"], &repo, &["contents"]);
                segments.extend(&file_segments);
                let mut url = Self::api_url(project, &segments)?;
                url.query_pairs_mut().append_pair("ref", commit);
                (url, "application/vnd.github.raw")
            }
            Platform::GitLab => {
                let mut url = Self::api_url(
                    project,
                    &["projects", repo_path.as_str(), "repository", "files", path, "raw"],
                )?;
                url.query_pairs_mut().append_pair("ref", commit);
                (url, "text/plain")
            }
            Platform::Bitbucket => {
                let mut segments = Self::segments(&["repositories"], &repo, &["src", commit]);
                segments.extend(&file_segments);
                (Self::api_url(project, &segments)?, "text/plain")
            }
        };

        let response = self
            .authorize(project, self.client.get(url))
            .header("Accept", accept)
            .send()
            .await
            .context("Failed to send file request")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let text = Self::check(response, "file fetch")
            .await?
            .text()
            .await
            .context("Failed to read file contents")?;
        Ok(Some(text))
    }

    async fn set_commit_status(
        &self,
        project: &Project,
        job: &ReviewJob,
        state: CommitState,
        description: &str,
    ) -> Result<()> {
        if project.access_token.is_none() {
            debug!(project_id = project.id, "No access token, skipping commit status");
            return Ok(());
        }
        let repo = Self::repo_segments(project);
        let repo_path = project.repo_path();
        let sha = job.commit_hash.as_str();

        match project.platform {
            Platform::GitHub => {
                let url = Self::api_url(
                    project,
                    &Self::segments(&["repos"], &repo, &["statuses", sha]),
                )?;
                self.post_json(
                    project,
                    url,
                    json!({
                        "state": state.github(),
                        "description": description,
                        "context": STATUS_CONTEXT,
                    }),
                    "commit status",
                )
                .await
            }
            Platform::GitLab => {
                let mut url =
                    Self::api_url(project, &["projects", repo_path.as_str(), "statuses", sha])?;
                url.query_pairs_mut()
                    .append_pair("state", state.gitlab())
                    .append_pair("name", STATUS_CONTEXT)
                    .append_pair("description", description);
                self.post_json(project, url, json!({}), "commit status").await
            }
            Platform::Bitbucket => {
                let url = Self::api_url(
                    project,
                    &Self::segments(
                        &["repositories"],
                        &repo,
                        &["commit", sha, "statuses", "build"],
                    ),
                )?;
                self.post_json(
                    project,
                    url,
                    json!({
                        "state": state.bitbucket(),
                        "key": STATUS_CONTEXT,
                        "name": STATUS_CONTEXT,
                        "description": description,
                        "url": project.url,
                    }),
                    "commit status",
                )
                .await
            }
        }
    }

    async fn post_comment(&self, project: &Project, job: &ReviewJob, body: &str) -> Result<()> {
        if project.access_token.is_none() {
            debug!(project_id = project.id, "No access token, skipping comment");
            return Ok(());
        }
        let repo = Self::repo_segments(project);
        let repo_path = project.repo_path();
        let sha = job.commit_hash.as_str();
        let mr = job.merge_request.as_ref().map(|m| m.number.to_string());

        let (url, payload) = match (project.platform, mr.as_deref()) {
            (Platform::GitHub, Some(number)) => (
                Self::api_url(
                    project,
                    &Self::segments(&["repos"], &repo, &["issues", number, "comments"]),
                )?,
                json!({ "body": body }),
            ),
            (Platform::GitHub, None) => (
                Self::api_url(
                    project,
                    &Self::segments(&["repos"], &repo, &["commits", sha, "comments"]),
                )?,
                json!({ "body": body }),
            ),
            (Platform::GitLab, Some(iid)) => (
                Self::api_url(
                    project,
                    &["projects", repo_path.as_str(), "merge_requests", iid, "notes"],
                )?,
                json!({ "body": body }),
            ),
            (Platform::GitLab, None) => (
                Self::api_url(
                    project,
                    &["projects", repo_path.as_str(), "repository", "commits", sha, "comments"],
                )?,
                json!({ "note": body }),
            ),
            (Platform::Bitbucket, Some(id)) => (
                Self::api_url(
                    project,
                    &Self::segments(&["repositories"], &repo, &["pullrequests", id, "comments"]),
                )?,
                json!({ "content": { "raw": body } }),
            ),
            (Platform::Bitbucket, None) => (
                Self::api_url(
                    project,
                    &Self::segments(&["repositories"], &repo, &["commit", sha, "comments"]),
                )?,
                json!({ "content": { "raw": body } }),
            ),
        };

        self.post_json(project, url, payload, "comment").await?;
        info!(job_id = %job.id, project_id = project.id, "Posted review comment");
        Ok(())
    }
}
