//! Operator endpoints for inspecting and re-driving jobs.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Json;
use revhook_core::{JobId, ReviewJob};

use super::ApiError;
use crate::auth::{admin_token_matches, bearer_token};
use crate::retry::RetryError;
use crate::AppState;

pub(super) fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let expected = state
        .admin_token
        .as_deref()
        .ok_or(ApiError::Disabled("administration"))?;
    if admin_token_matches(expected, bearer_token(headers)) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

impl From<RetryError> for ApiError {
    fn from(err: RetryError) -> Self {
        match err {
            RetryError::NotFound(_) => Self::NotFound(err.to_string()),
            RetryError::NotFailed(..) => Self::Conflict(err.to_string()),
            RetryError::Store(_) | RetryError::Queue(_) => Self::Internal(err.to_string()),
        }
    }
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<ReviewJob>, ApiError> {
    require_admin(&state, &headers)?;
    state
        .store
        .get(JobId(id))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("job {} not found", id)))
}

/// Re-queue a failed job now, regardless of its attempt count.
pub async fn retry_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<ReviewJob>, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.retry.retry_now(JobId(id)).await?))
}
