//! Webhook receivers.
//!
//! Three ways in: platform detected from headers, platform from the path,
//! or platform and project from the path. All end in the same ingestor.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Json;
use serde::Serialize;

use crate::error::IngestError;
use crate::ingest::{Delivery, IngestOutcome};
use crate::platform::Platform;
use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum WebhookResponse {
    Queued { job_id: i64 },
    Duplicate { job_id: i64 },
    Ignored { reason: String },
}

impl From<IngestOutcome> for WebhookResponse {
    fn from(outcome: IngestOutcome) -> Self {
        match outcome {
            IngestOutcome::Queued(id) => Self::Queued { job_id: id.0 },
            IngestOutcome::Duplicate(id) => Self::Duplicate { job_id: id.0 },
            IngestOutcome::Ignored(reason) => Self::Ignored { reason },
        }
    }
}

fn parse_platform(raw: &str) -> Result<Platform, IngestError> {
    raw.parse()
        .map_err(|_| IngestError::UnsupportedEvent(format!("unknown platform '{}'", raw)))
}

async fn receive(
    state: &AppState,
    platform: Option<Platform>,
    project_id: Option<i64>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Json<WebhookResponse>, IngestError> {
    let outcome = state
        .ingestor
        .ingest(Delivery {
            platform,
            project_id,
            headers,
            body,
        })
        .await?;
    Ok(Json(outcome.into()))
}

pub async fn generic_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, IngestError> {
    receive(&state, None, None, &headers, &body).await
}

pub async fn platform_webhook(
    State(state): State<Arc<AppState>>,
    Path(platform): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, IngestError> {
    let platform = parse_platform(&platform)?;
    receive(&state, Some(platform), None, &headers, &body).await
}

pub async fn project_webhook(
    State(state): State<Arc<AppState>>,
    Path((platform, project_id)): Path<(String, i64)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, IngestError> {
    let platform = parse_platform(&platform)?;
    receive(&state, Some(platform), Some(project_id), &headers, &body).await
}
