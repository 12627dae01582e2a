//! Registered projects and their review policy.
//!
//! Project CRUD lives elsewhere; this service only answers lookups. The
//! registry is loaded once from a JSON file at start-up.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use revhook_core::{DiffFilter, JobEventType};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::filter::BranchFilter;
use crate::platform::Platform;

fn default_true() -> bool {
    true
}

fn default_events() -> Vec<JobEventType> {
    vec![JobEventType::Push, JobEventType::MergeRequest]
}

fn default_min_score() -> f64 {
    60.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub platform: Platform,
    /// Browser URL of the repository, e.g. `https://gitlab.example.com/group/app`.
    pub url: String,
    /// Override for the platform's REST API base URL.
    #[serde(default)]
    pub api_url: Option<String>,
    /// GitLab token / GitHub HMAC key / Bitbucket HMAC key.
    #[serde(default)]
    pub webhook_secret: Option<String>,
    /// Token for diff fetching and status/comment posting.
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_true")]
    pub review_enabled: bool,
    #[serde(default = "default_events")]
    pub review_events: Vec<JobEventType>,
    /// Comma-separated branch globs that never get reviewed.
    #[serde(default)]
    pub branch_filter: String,
    /// Comma-separated extension allow-list, e.g. `.go,.ts`. Empty allows all.
    #[serde(default)]
    pub file_extensions: String,
    /// Comma-separated path globs excluded from review.
    #[serde(default)]
    pub ignore_patterns: String,
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    #[serde(default)]
    pub comment_enabled: bool,
    #[serde(default)]
    pub file_context: bool,
    #[serde(default)]
    pub notify_webhook_url: Option<String>,
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split([',', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Project {
    pub fn secret(&self) -> Option<&str> {
        self.webhook_secret
            .as_deref()
            .filter(|s| !s.trim().is_empty())
    }

    pub fn accepts_event(&self, event_type: JobEventType) -> bool {
        self.review_events.contains(&event_type)
    }

    pub fn branch_filter(&self) -> BranchFilter {
        BranchFilter::parse(&self.branch_filter)
    }

    pub fn diff_filter(&self) -> Result<DiffFilter, glob::PatternError> {
        DiffFilter::new(
            &split_list(&self.file_extensions),
            &split_list(&self.ignore_patterns),
        )
    }

    /// `owner/repo` style path of the repository on its host.
    pub fn repo_path(&self) -> String {
        let url = normalize_repo_url(&self.url);
        match url.split_once('/') {
            Some((_, path)) => path.to_string(),
            None => String::new(),
        }
    }

    /// `scheme://host` of the repository URL.
    pub fn origin(&self) -> String {
        let trimmed = self.url.trim();
        let (scheme, rest) = trimmed.split_once("://").unwrap_or(("https", trimmed));
        let host = rest.split('/').next().unwrap_or(rest);
        format!("{}://{}", scheme, host)
    }
}

/// Canonical form used to compare repository URLs.
///
/// Strips the scheme, a trailing slash and a trailing `.git`, and lowercases
/// the rest, so `https://host/Group/App.git` and `http://host/group/app/`
/// compare equal.
pub fn normalize_repo_url(url: &str) -> String {
    let url = url.trim();
    let url = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let url = url.trim_end_matches('/');
    let url = url.strip_suffix(".git").unwrap_or(url);
    url.trim_end_matches('/').to_lowercase()
}

#[async_trait]
pub trait ProjectService: Send + Sync {
    async fn get_by_id(&self, id: i64) -> Option<Arc<Project>>;

    /// Look up by any of the repository URLs a payload may carry.
    async fn get_by_url(&self, url: &str) -> Option<Arc<Project>>;
}

/// In-memory project registry.
#[derive(Debug, Default)]
pub struct FileProjectRegistry {
    by_id: HashMap<i64, Arc<Project>>,
    by_url: HashMap<String, i64>,
}

impl FileProjectRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read projects file {}", path.display()))?;
        let projects: Vec<Project> = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse projects file {}", path.display()))?;
        Self::from_projects(projects)
    }

    pub fn from_projects(projects: Vec<Project>) -> Result<Self> {
        let mut registry = Self::default();
        for project in projects {
            project
                .diff_filter()
                .with_context(|| format!("Project {} has an invalid ignore pattern", project.id))?;
            if registry.by_id.contains_key(&project.id) {
                bail!("Duplicate project id {}", project.id);
            }
            let key = normalize_repo_url(&project.url);
            if let Some(existing) = registry.by_url.insert(key, project.id) {
                bail!(
                    "Projects {} and {} share the repository URL {}",
                    existing,
                    project.id,
                    project.url
                );
            }
            registry.by_id.insert(project.id, Arc::new(project));
        }
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[async_trait]
impl ProjectService for FileProjectRegistry {
    async fn get_by_id(&self, id: i64) -> Option<Arc<Project>> {
        self.by_id.get(&id).cloned()
    }

    async fn get_by_url(&self, url: &str) -> Option<Arc<Project>> {
        let id = self.by_url.get(&normalize_repo_url(url))?;
        self.by_id.get(id).cloned()
    }
}

#[cfg(test)]
pub(crate) fn test_project(id: i64, platform: Platform) -> Project {
    Project {
        id,
        name: format!("project-{}", id),
        platform,
        url: format!("https://git.example.com/team/app{}", id),
        api_url: None,
        webhook_secret: Some("s3cret".to_string()),
        access_token: Some("token".to_string()),
        review_enabled: true,
        review_events: default_events(),
        branch_filter: String::new(),
        file_extensions: String::new(),
        ignore_patterns: String::new(),
        min_score: 60.0,
        comment_enabled: false,
        file_context: false,
        notify_webhook_url: None,
    }
}
