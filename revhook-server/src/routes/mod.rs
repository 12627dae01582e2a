//! HTTP surface.
//!
//! Webhook and synchronous-review routes sit behind the per-IP rate limiter;
//! the rest are cheap reads or authenticated admin calls.

pub mod jobs;
pub mod review;
pub mod stream;
pub mod webhook;

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use thiserror::Error;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::error::StoreError;
use crate::rate_limit::rate_limit_middleware;
use crate::AppState;

/// Errors from the non-webhook endpoints.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0} is disabled")]
    Disabled(&'static str),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Disabled(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(detail) => {
                tracing::error!(error = %detail, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let message = match &self {
            Self::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "revhook",
        "version": crate::version(),
        "queue": state.queue.backend(),
        "subscribers": {
            "reviews": state.review_events.client_count(),
            "imports": state.import_events.client_count(),
        }
    }))
}

pub fn router(state: Arc<AppState>) -> Router {
    let limited = Router::new()
        .route("/webhook", post(webhook::generic_webhook))
        .route("/webhook/{platform}", post(webhook::platform_webhook))
        .route(
            "/webhook/{platform}/{project_id}",
            post(webhook::project_webhook),
        )
        .route("/api/review/sync", post(review::sync_review))
        .route_layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ));

    Router::new()
        .merge(limited)
        .route("/api/review/score", get(review::score))
        .route("/api/events/reviews", get(stream::review_stream))
        .route("/api/events/imports", get(stream::import_stream))
        .route("/api/events/token", post(stream::issue_token))
        .route("/api/jobs/{id}", get(jobs::get_job))
        .route("/api/jobs/{id}/retry", post(jobs::retry_job))
        .route("/health", get(health_check))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config::{RateLimitSettings, RetrySettings};
    use crate::hub::{EventHub, DEFAULT_CLIENT_BUFFER};
    use crate::idempotency::IdempotencyGuard;
    use crate::ingest::WebhookIngestor;
    use crate::processor::tests::{harness, Harness};
    use crate::projects::Project;
    use crate::queue::testing::RecordingQueue;
    use crate::rate_limit::RateLimiter;
    use crate::retry::RetryScheduler;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    pub(crate) struct TestApp {
        pub router: Router,
        pub state: Arc<AppState>,
        pub harness: Harness,
        pub queue: Arc<RecordingQueue>,
    }

    pub const ADMIN: &str = "admin-token";
    pub const JWT_SECRET: &str = "jwt-secret";

    /// Full router over in-memory collaborators.
    ///
    /// Webhook jobs land on a recording queue; the sync endpoint runs the
    /// real processor against the fake platform and a fixed-score engine.
    pub fn test_app(project: Project, diff: &str, score: f64, burst: u32) -> TestApp {
        let harness = harness(project.clone(), diff, score);
        let projects = Arc::new(
            crate::projects::FileProjectRegistry::from_projects(vec![project]).unwrap(),
        );
        let queue = Arc::new(RecordingQueue::default());
        let retry = Arc::new(RetryScheduler::new(
            harness.store.clone(),
            harness.store.clone(),
            queue.clone(),
            harness.hub.clone(),
            RetrySettings {
                interval: Duration::from_secs(180),
                lock_ttl: Duration::from_secs(150),
                max_attempts: 3,
                batch_size: 50,
                stale_after: Duration::from_secs(600),
            },
            "test",
        ));
        let state = Arc::new(AppState {
            projects: projects.clone(),
            store: harness.store.clone(),
            ingestor: WebhookIngestor::new(
                projects,
                harness.store.clone(),
                queue.clone(),
                harness.hub.clone(),
            ),
            guard: IdempotencyGuard::new(harness.store.clone()),
            queue: queue.clone(),
            processor: harness.processor.clone(),
            retry,
            review_events: harness.hub.clone(),
            import_events: Arc::new(EventHub::new("imports", DEFAULT_CLIENT_BUFFER)),
            rate_limiter: Arc::new(RateLimiter::new(RateLimitSettings {
                per_second: 0.001,
                burst,
                idle_timeout: Duration::from_secs(600),
                max_tracked_ips: 100,
                trust_forwarded_for: false,
            })),
            stream_jwt_secret: Some(JWT_SECRET.to_string()),
            admin_token: Some(ADMIN.to_string()),
            job_timeout: Duration::from_secs(5),
        });
        TestApp {
            router: router(state.clone()),
            state,
            harness,
            queue,
        }
    }

    pub async fn send(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| {
                    serde_json::Value::String(String::from_utf8_lossy(&bytes).into())
                })
        };
        (status, body)
    }
}
