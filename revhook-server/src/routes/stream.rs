//! Server-sent event streams of review and import events.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Json;
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::jobs::require_admin;
use super::ApiError;
use crate::auth::{bearer_token, issue_stream_token, verify_stream_token};
use crate::hub::{EventHub, Subscription};
use crate::AppState;

pub const DEFAULT_TOKEN_TTL_SECS: u64 = 3600;
pub const MAX_TOKEN_TTL_SECS: u64 = 7 * 24 * 3600;

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub subject: String,
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
    pub expires_in: u64,
}

/// Check the stream token and return the subject it was issued to.
fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    query: &StreamQuery,
) -> Result<String, ApiError> {
    let secret = state
        .stream_jwt_secret
        .as_deref()
        .ok_or(ApiError::Disabled("event streaming"))?;
    let token = bearer_token(headers)
        .or(query.token.as_deref())
        .ok_or(ApiError::Unauthorized)?;
    match verify_stream_token(secret, token) {
        Ok(claims) => Ok(claims.sub),
        Err(e) => {
            warn!("Rejected stream token: {:#}", e);
            Err(ApiError::Unauthorized)
        }
    }
}

/// Frames for one subscription until the hub drops it.
///
/// Dropping the stream (client disconnect) drops the subscription, which
/// unsubscribes it.
fn frames<T>(
    subscription: Subscription<T>,
    event_name: &'static str,
) -> impl Stream<Item = Result<Event, Infallible>>
where
    T: Clone + Send + Serialize + 'static,
{
    stream::unfold(subscription, move |mut subscription| async move {
        let event = subscription.recv().await?;
        let frame = match Event::default().event(event_name).json_data(&event) {
            Ok(frame) => frame,
            Err(e) => Event::default().comment(format!("unserialisable event: {}", e)),
        };
        Some((Ok(frame), subscription))
    })
}

fn open<T>(
    hub: &Arc<EventHub<T>>,
    subject: &str,
    event_name: &'static str,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    T: Clone + Send + Serialize + 'static,
{
    let subscription = hub.subscribe_guarded(format!("{}-{}", subject, Uuid::new_v4()));
    info!(
        client_id = %subscription.client_id(),
        stream = event_name,
        "Stream client connected"
    );
    Sse::new(frames(subscription, event_name)).keep_alive(KeepAlive::default())
}

pub async fn review_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let subject = authorize(&state, &headers, &query)?;
    Ok(open(&state.review_events, &subject, "review"))
}

pub async fn import_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let subject = authorize(&state, &headers, &query)?;
    Ok(open(&state.import_events, &subject, "import"))
}

/// Mint a stream token for a dashboard or other subscriber. Admin only.
pub async fn issue_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<TokenRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    require_admin(&state, &headers)?;
    let secret = state
        .stream_jwt_secret
        .as_deref()
        .ok_or(ApiError::Disabled("event streaming"))?;

    let subject = request.subject.trim();
    if subject.is_empty() {
        return Err(ApiError::BadRequest("subject is required".to_string()));
    }
    let ttl = request.ttl_secs.unwrap_or(DEFAULT_TOKEN_TTL_SECS);
    if ttl == 0 || ttl > MAX_TOKEN_TTL_SECS {
        return Err(ApiError::BadRequest(format!(
            "ttl_secs must be between 1 and {}",
            MAX_TOKEN_TTL_SECS
        )));
    }

    let token = issue_stream_token(secret, subject, ttl)
        .map_err(|e| ApiError::Internal(format!("{:#}", e)))?;
    info!(subject = %subject, ttl_secs = ttl, "Issued stream token");
    Ok(Json(TokenResponse {
        token,
        expires_in: ttl,
    }))
}
