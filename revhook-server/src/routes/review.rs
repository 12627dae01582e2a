//! Synchronous review for pre-receive hooks, and score lookups for CI.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Json;
use revhook_core::{
    gate_verdict, Author, ChangeStats, JobEventType, JobId, NewJob, ReviewEvent, ReviewEventKind,
    ReviewJob, ScoreResponse, SyncReviewRequest, SyncReviewResponse,
};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::info;

use super::ApiError;
use crate::auth::bearer_token;
use crate::idempotency::Admission;
use crate::platform::branch_from_ref;
use crate::queue::execute;
use crate::signature::verify_token;
use crate::AppState;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

fn new_job(request: SyncReviewRequest) -> NewJob {
    NewJob {
        project_id: request.project_id,
        commit_hash: request.commit_hash,
        base_commit: request.base_commit,
        event_type: JobEventType::Push,
        branch: branch_from_ref(&request.branch).to_string(),
        author: Author {
            name: request.author_name.unwrap_or_else(|| "unknown".to_string()),
            email: request.author_email,
            avatar_url: None,
            profile_url: None,
        },
        commit_message: request.commit_message,
        merge_request: None,
        diff: Some(request.diff),
        stats: ChangeStats::default(),
    }
}

/// Poll until `job_id` settles or `timeout` runs out.
async fn wait_until_settled(
    state: &AppState,
    job_id: JobId,
    timeout: Duration,
) -> Result<ReviewJob, ApiError> {
    let deadline = Instant::now() + timeout;
    loop {
        let job = state
            .store
            .get(job_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("job {} not found", job_id)))?;
        if job.status.is_terminal() || Instant::now() >= deadline {
            return Ok(job);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Review a pushed commit and block until there is a verdict.
///
/// The caller authenticates with the project's webhook secret. A commit that
/// already has a job waits for that job instead of starting another.
pub async fn sync_review(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<SyncReviewRequest>,
) -> Result<Json<SyncReviewResponse>, ApiError> {
    let project = state
        .projects
        .get_by_id(request.project_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("project {} not found", request.project_id)))?;
    let authorized = match (project.secret(), bearer_token(&headers)) {
        (Some(secret), Some(presented)) => verify_token(secret, presented),
        _ => false,
    };
    if !authorized {
        return Err(ApiError::Unauthorized);
    }
    if request.commit_hash.trim().is_empty() {
        return Err(ApiError::BadRequest("commit_hash is required".to_string()));
    }

    let job = match state.guard.admit(new_job(request)).await? {
        Admission::Fresh(job) => {
            state
                .review_events
                .publish(ReviewEvent::from_job(ReviewEventKind::ReviewCreated, &job));
            info!(job_id = %job.id, project_id = project.id, "Running synchronous review");
            execute(state.processor.as_ref(), job.id, state.job_timeout).await;
            wait_until_settled(&state, job.id, Duration::ZERO).await?
        }
        Admission::Duplicate(id) => wait_until_settled(&state, id, state.job_timeout).await?,
    };

    let passed = gate_verdict(job.status, job.score, project.min_score).unwrap_or(false);
    let error = match (&job.error_message, job.status.is_terminal()) {
        (Some(message), _) => Some(message.clone()),
        (None, false) => Some("review did not finish in time".to_string()),
        (None, true) => None,
    };
    Ok(Json(SyncReviewResponse {
        job_id: job.id,
        status: job.status,
        score: job.score,
        min_score: project.min_score,
        passed,
        review: job.review_result,
        error,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ScoreQuery {
    pub project_id: i64,
    pub commit: String,
}

pub async fn score(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ScoreQuery>,
) -> Result<Json<ScoreResponse>, ApiError> {
    let project = state
        .projects
        .get_by_id(query.project_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("project {} not found", query.project_id)))?;
    let job = state
        .store
        .find_by_commit(project.id, &query.commit)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no review for commit {}", query.commit)))?;

    Ok(Json(ScoreResponse {
        project_id: project.id,
        commit_hash: job.commit_hash.clone(),
        job_id: job.id,
        status: job.status,
        score: job.score,
        min_score: project.min_score,
        passed: gate_verdict(job.status, job.score, project.min_score),
    }))
}
