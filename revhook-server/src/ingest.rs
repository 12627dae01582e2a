//! Webhook ingestion: verify, normalise, deduplicate, enqueue.
//!
//! Everything here runs inside the webhook request. The job row exists
//! before the response goes out; the review itself happens later on the
//! task queue.

use std::sync::Arc;

use axum::http::HeaderMap;
use revhook_core::{JobId, ReviewEvent, ReviewEventKind};
use tracing::{info, warn};

use crate::error::IngestError;
use crate::hub::EventHub;
use crate::idempotency::{Admission, IdempotencyGuard};
use crate::platform::{Decoded, Normalized, Platform, PlatformEvent};
use crate::projects::{Project, ProjectService};
use crate::queue::TaskQueue;
use crate::signature;
use crate::store::JobStore;

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Queued(JobId),
    /// Acknowledged; an existing job already covers the commit.
    Duplicate(JobId),
    /// Acknowledged; nothing to review.
    Ignored(String),
}

/// One inbound delivery as the HTTP layer saw it.
#[derive(Debug, Clone, Copy)]
pub struct Delivery<'a> {
    /// From the route, or detected from headers when `None`.
    pub platform: Option<Platform>,
    /// From the route, or resolved from the payload's repository URL.
    pub project_id: Option<i64>,
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
}

pub struct WebhookIngestor {
    projects: Arc<dyn ProjectService>,
    store: Arc<dyn JobStore>,
    guard: IdempotencyGuard,
    queue: Arc<dyn TaskQueue>,
    hub: Arc<EventHub<ReviewEvent>>,
}

impl WebhookIngestor {
    pub fn new(
        projects: Arc<dyn ProjectService>,
        store: Arc<dyn JobStore>,
        queue: Arc<dyn TaskQueue>,
        hub: Arc<EventHub<ReviewEvent>>,
    ) -> Self {
        Self {
            guard: IdempotencyGuard::new(store.clone()),
            projects,
            store,
            queue,
            hub,
        }
    }

    pub async fn ingest(&self, delivery: Delivery<'_>) -> Result<IngestOutcome, IngestError> {
        let result = self.ingest_inner(delivery).await;
        match &result {
            Ok(IngestOutcome::Ignored(reason)) => info!(reason = %reason, "Webhook ignored"),
            Ok(_) => {}
            Err(e @ (IngestError::Store(_) | IngestError::Queue(_))) => {
                tracing::error!(error = %e, "Webhook ingestion failed")
            }
            Err(e) => warn!(error = %e, "Webhook rejected"),
        }
        result
    }

    async fn ingest_inner(&self, delivery: Delivery<'_>) -> Result<IngestOutcome, IngestError> {
        let platform = match delivery.platform {
            Some(platform) => platform,
            None => Platform::detect(delivery.headers)
                .ok_or_else(|| IngestError::UnsupportedEvent("unrecognised sender".into()))?,
        };
        let event_name = platform.event_name(delivery.headers).ok_or_else(|| {
            IngestError::InvalidPayload(format!("missing {} header", platform.event_header()))
        })?;

        let (project, event) = match delivery.project_id {
            Some(id) => {
                // Known project: authenticate before looking at the payload.
                let project = self
                    .projects
                    .get_by_id(id)
                    .await
                    .ok_or_else(|| IngestError::ProjectNotFound(id.to_string()))?;
                check_platform(&project, platform)?;
                signature::verify(platform, project.secret(), delivery.headers, delivery.body)?;
                match PlatformEvent::decode(platform, &event_name, delivery.body)? {
                    Decoded::Event(event) => (project, event),
                    Decoded::Ignored(reason) => return Ok(IngestOutcome::Ignored(reason)),
                }
            }
            None => {
                let event = match PlatformEvent::decode(platform, &event_name, delivery.body)? {
                    Decoded::Event(event) => event,
                    Decoded::Ignored(reason) => return Ok(IngestOutcome::Ignored(reason)),
                };
                let project = self.resolve_by_url(&event).await?;
                check_platform(&project, platform)?;
                signature::verify(platform, project.secret(), delivery.headers, delivery.body)?;
                (project, event)
            }
        };

        if let Some(reason) = policy_rejection(&project, &event) {
            return Ok(IngestOutcome::Ignored(reason));
        }

        let new = match event.normalize(project.id)? {
            Normalized::Job(new) => *new,
            Normalized::Ignored(reason) => return Ok(IngestOutcome::Ignored(reason)),
        };

        let job = match self.guard.admit(new).await? {
            Admission::Duplicate(id) => return Ok(IngestOutcome::Duplicate(id)),
            Admission::Fresh(job) => job,
        };
        self.hub
            .publish(ReviewEvent::from_job(ReviewEventKind::ReviewCreated, &job));

        if let Err(e) = self.queue.enqueue(job.id).await {
            // Leave it where the retry sweep can find it.
            let mut job = job;
            job.mark_failed(format!("enqueue failed: {}", e));
            self.store.update(&job).await?;
            return Err(e.into());
        }

        info!(
            job_id = %job.id,
            project_id = project.id,
            platform = %event.platform(),
            event = %job.event_type,
            branch = %job.branch,
            commit = %job.short_commit(),
            "Review job queued"
        );
        Ok(IngestOutcome::Queued(job.id))
    }

    async fn resolve_by_url(&self, event: &PlatformEvent) -> Result<Arc<Project>, IngestError> {
        let urls = event.repository_urls();
        for url in &urls {
            if let Some(project) = self.projects.get_by_url(url).await {
                return Ok(project);
            }
        }
        Err(IngestError::ProjectNotFound(
            urls.first().copied().unwrap_or("<no repository url>").to_string(),
        ))
    }
}

fn check_platform(project: &Project, platform: Platform) -> Result<(), IngestError> {
    if project.platform == platform {
        Ok(())
    } else {
        Err(IngestError::InvalidPayload(format!(
            "project {} is a {} project, not {}",
            project.id, project.platform, platform
        )))
    }
}

/// Per-project rules applied before a job is created.
fn policy_rejection(project: &Project, event: &PlatformEvent) -> Option<String> {
    if !project.review_enabled {
        return Some("reviews are disabled for this project".to_string());
    }
    let event_type = event.event_type();
    if !project.accepts_event(event_type) {
        return Some(format!("{} events are not reviewed for this project", event_type));
    }
    let filter = project.branch_filter();
    event
        .branches()
        .into_iter()
        .find(|branch| filter.ignores(branch))
        .map(|branch| format!("branch {} is ignored", branch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::DEFAULT_CLIENT_BUFFER;
    use crate::platform::{bitbucket, github, gitlab};
    use crate::projects::{test_project, FileProjectRegistry};
    use crate::queue::testing::RecordingQueue;
    use crate::signature::{
        format_signature, BITBUCKET_SIGNATURE_HEADER, GITHUB_SIGNATURE_HEADER, GITLAB_TOKEN_HEADER,
    };
    use crate::store::InMemoryStore;
    use axum::http::HeaderValue;
    use revhook_core::{JobEventType, JobStatus};

    const SHA: &str = "9f2c1e0a9f2c1e0a9f2c1e0a9f2c1e0a9f2c1e0a";

    struct Fixture {
        ingestor: WebhookIngestor,
        store: Arc<InMemoryStore>,
        queue: Arc<RecordingQueue>,
        hub: Arc<EventHub<ReviewEvent>>,
    }

    fn fixture(projects: Vec<Project>) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(RecordingQueue::default());
        let hub = Arc::new(EventHub::new("reviews", DEFAULT_CLIENT_BUFFER));
        let registry = Arc::new(FileProjectRegistry::from_projects(projects).unwrap());
        Fixture {
            ingestor: WebhookIngestor::new(registry, store.clone(), queue.clone(), hub.clone()),
            store,
            queue,
            hub,
        }
    }

    fn gitlab_project() -> Project {
        let mut project = test_project(1, Platform::GitLab);
        project.url = "https://gitlab.example.com/team/app".into();
        project
    }

    fn github_project() -> Project {
        let mut project = test_project(2, Platform::GitHub);
        project.url = "https://github.com/octo/app".into();
        project
    }

    fn headers(pairs: &[(&'static str, String)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    fn gitlab_headers(event: &str, token: &str) -> HeaderMap {
        headers(&[
            ("x-gitlab-event", event.to_string()),
            (GITLAB_TOKEN_HEADER, token.to_string()),
        ])
    }

    fn github_headers(event: &str, secret: &str, body: &[u8]) -> HeaderMap {
        headers(&[
            ("x-github-event", event.to_string()),
            (GITHUB_SIGNATURE_HEADER, format_signature(secret, body)),
        ])
    }

    async fn run(
        f: &Fixture,
        platform: Option<Platform>,
        project_id: Option<i64>,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<IngestOutcome, IngestError> {
        f.ingestor
            .ingest(Delivery {
                platform,
                project_id,
                headers,
                body,
            })
            .await
    }

    #[tokio::test]
    async fn test_same_delivery_twice_creates_one_job() {
        let f = fixture(vec![gitlab_project()]);
        let body = gitlab::fixtures::push(SHA, 3, "main").to_string();
        let h = gitlab_headers("Push Hook", "s3cret");

        let first = run(&f, Some(Platform::GitLab), Some(1), &h, body.as_bytes()).await.unwrap();
        let second = run(&f, Some(Platform::GitLab), Some(1), &h, body.as_bytes()).await.unwrap();

        let IngestOutcome::Queued(id) = first else {
            panic!("expected queued, got {:?}", first);
        };
        assert_eq!(second, IngestOutcome::Duplicate(id));
        assert_eq!(f.queue.enqueued(), vec![id]);

        let job = f.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.commit_hash, SHA);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(f.store.list_by_status(JobStatus::Pending, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_github_wrong_secret_is_rejected_and_not_queued() {
        let f = fixture(vec![github_project()]);
        let body = github::fixtures::push(SHA, "main").to_string();
        let h = github_headers("push", "not-the-secret", body.as_bytes());

        let err = run(&f, None, None, &h, body.as_bytes()).await.unwrap_err();
        assert!(matches!(err, IngestError::Unauthorized(_)));
        assert!(f.queue.enqueued().is_empty());
        assert!(f.store.find_by_commit(2, SHA).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_github_resolved_by_repository_url() {
        let f = fixture(vec![github_project()]);
        let mut events = f.hub.subscribe("watcher");
        let body = github::fixtures::pull_request("opened", SHA).to_string();
        let h = github_headers("pull_request", "s3cret", body.as_bytes());

        let outcome = run(&f, Some(Platform::GitHub), None, &h, body.as_bytes()).await.unwrap();
        let IngestOutcome::Queued(id) = outcome else {
            panic!("expected queued");
        };
        let job = f.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.event_type, JobEventType::MergeRequest);
        assert_eq!(job.merge_request.as_ref().map(|m| m.number), Some(42));

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, ReviewEventKind::ReviewCreated);
        assert_eq!(event.job_id, id);
    }

    #[tokio::test]
    async fn test_ignored_branch_creates_no_job() {
        let mut project = gitlab_project();
        project.branch_filter = "release/*".into();
        let f = fixture(vec![project]);
        let body = gitlab::fixtures::push(SHA, 1, "release/1.0").to_string();

        let headers = gitlab_headers("Push Hook", "s3cret");
        let outcome = run(&f, Some(Platform::GitLab), Some(1), &headers, body.as_bytes())
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Ignored(_)));
        assert!(f.queue.enqueued().is_empty());
        assert!(f.store.find_by_commit(1, SHA).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_merge_request_target_branch_is_checked() {
        let mut project = gitlab_project();
        project.branch_filter = "main".into();
        let f = fixture(vec![project]);
        let body = gitlab::fixtures::merge_request("open", SHA).to_string();

        let headers = gitlab_headers("Merge Request Hook", "s3cret");
        let outcome = run(&f, None, Some(1), &headers, body.as_bytes())
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Ignored("branch main is ignored".into()));
    }

    #[tokio::test]
    async fn test_disabled_project_and_event_allow_list() {
        let mut disabled = gitlab_project();
        disabled.review_enabled = false;
        let f = fixture(vec![disabled]);
        let body = gitlab::fixtures::push(SHA, 1, "main").to_string();
        let h = gitlab_headers("Push Hook", "s3cret");
        assert!(matches!(
            run(&f, None, Some(1), &h, body.as_bytes()).await.unwrap(),
            IngestOutcome::Ignored(_)
        ));

        let mut mr_only = gitlab_project();
        mr_only.review_events = vec![JobEventType::MergeRequest];
        let f = fixture(vec![mr_only]);
        assert_eq!(
            run(&f, None, Some(1), &h, body.as_bytes()).await.unwrap(),
            IngestOutcome::Ignored("push events are not reviewed for this project".into())
        );
    }

    #[tokio::test]
    async fn test_bad_token_unknown_project_and_wrong_platform() {
        let f = fixture(vec![gitlab_project()]);
        let body = gitlab::fixtures::push(SHA, 1, "main").to_string();

        let err = run(&f, None, Some(1), &gitlab_headers("Push Hook", "guess"), body.as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Unauthorized(_)));

        let err = run(&f, None, Some(99), &gitlab_headers("Push Hook", "s3cret"), body.as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::ProjectNotFound(_)));

        let h = github_headers("push", "s3cret", body.as_bytes());
        let err = run(&f, Some(Platform::GitHub), Some(1), &h, body.as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::InvalidPayload(_)));
        assert!(f.queue.enqueued().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_repository_url_is_not_found() {
        let f = fixture(vec![gitlab_project()]);
        let body = github::fixtures::push(SHA, "main").to_string();
        let h = github_headers("push", "s3cret", body.as_bytes());
        let err = run(&f, None, None, &h, body.as_bytes()).await.unwrap_err();
        assert!(matches!(err, IngestError::ProjectNotFound(_)));
    }

    #[tokio::test]
    async fn test_missing_headers() {
        let f = fixture(vec![gitlab_project()]);
        let err = run(&f, None, None, &HeaderMap::new(), b"{}").await.unwrap_err();
        assert!(matches!(err, IngestError::UnsupportedEvent(_)));

        let err = run(&f, Some(Platform::GitLab), Some(1), &HeaderMap::new(), b"{}")
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn test_branch_deletion_is_acknowledged_without_job() {
        let f = fixture(vec![gitlab_project()]);
        let body = gitlab::fixtures::push(crate::platform::ZERO_SHA, 0, "gone").to_string();
        let headers = gitlab_headers("Push Hook", "s3cret");
        let outcome = run(&f, None, Some(1), &headers, body.as_bytes())
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Ignored(_)));
    }

    #[tokio::test]
    async fn test_bitbucket_without_secret_is_accepted() {
        let mut project = test_project(3, Platform::Bitbucket);
        project.url = "https://bitbucket.org/team/service".into();
        project.webhook_secret = None;
        let f = fixture(vec![project]);
        let body = bitbucket::fixtures::push(SHA, "main").to_string();
        let h = headers(&[("x-event-key", "repo:push".to_string())]);

        let outcome = run(&f, None, None, &h, body.as_bytes()).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Queued(_)));
    }

    #[tokio::test]
    async fn test_bitbucket_with_secret_requires_signature() {
        let mut project = test_project(3, Platform::Bitbucket);
        project.url = "https://bitbucket.org/team/service".into();
        let f = fixture(vec![project]);
        let body = bitbucket::fixtures::pull_request(SHA).to_string();

        let unsigned = headers(&[("x-event-key", "pullrequest:created".to_string())]);
        assert!(matches!(
            run(&f, None, None, &unsigned, body.as_bytes()).await,
            Err(IngestError::Unauthorized(_))
        ));

        let signed = headers(&[
            ("x-event-key", "pullrequest:created".to_string()),
            (BITBUCKET_SIGNATURE_HEADER, format_signature("s3cret", body.as_bytes())),
        ]);
        assert!(matches!(
            run(&f, None, None, &signed, body.as_bytes()).await,
            Ok(IngestOutcome::Queued(_))
        ));
    }

    #[tokio::test]
    async fn test_enqueue_failure_leaves_failed_job() {
        let f = fixture(vec![gitlab_project()]);
        *f.queue.reject.lock().unwrap() = true;
        let body = gitlab::fixtures::push(SHA, 1, "main").to_string();

        let err = run(&f, None, Some(1), &gitlab_headers("Push Hook", "s3cret"), body.as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Queue(_)));

        let job = f.store.find_by_commit(1, SHA).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.is_retryable(3));
    }
}
