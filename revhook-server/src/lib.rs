pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod filter;
pub mod hub;
pub mod idempotency;
pub mod ingest;
pub mod notify;
pub mod platform;
pub mod platform_client;
pub mod processor;
pub mod projects;
pub mod queue;
pub mod rate_limit;
pub mod retry;
pub mod routes;
pub mod signature;
pub mod store;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use revhook_core::{ImportEvent, ReviewEvent};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::hub::EventHub;
use crate::idempotency::IdempotencyGuard;
use crate::ingest::WebhookIngestor;
use crate::projects::ProjectService;
use crate::queue::{JobProcessor, TaskQueue};
use crate::rate_limit::RateLimiter;
use crate::retry::RetryScheduler;
use crate::store::JobStore;

pub use revhook_core::version;

/// Shared handles for every request handler.
pub struct AppState {
    pub projects: Arc<dyn ProjectService>,
    pub store: Arc<dyn JobStore>,
    pub ingestor: WebhookIngestor,
    pub guard: IdempotencyGuard,
    pub queue: Arc<dyn TaskQueue>,
    /// Run directly by the synchronous review endpoint.
    pub processor: Arc<dyn JobProcessor>,
    pub retry: Arc<RetryScheduler>,
    pub review_events: Arc<EventHub<ReviewEvent>>,
    /// Served on `/api/events/imports`. Nothing in this server publishes to it
    /// yet; an importer running in-process would.
    pub import_events: Arc<EventHub<ImportEvent>>,
    pub rate_limiter: Arc<RateLimiter>,
    pub stream_jwt_secret: Option<String>,
    pub admin_token: Option<String>,
    pub job_timeout: Duration,
}

/// Wait for `signal`, then stop background work and end every live stream.
///
/// Hand this to `with_graceful_shutdown`. Event streams never finish on their
/// own, so the server can only drain once the hubs here have been closed.
pub async fn shutdown_on<F>(signal: F, background: CancellationToken, state: Arc<AppState>)
where
    F: Future<Output = ()>,
{
    signal.await;
    info!("Stopping background work");
    background.cancel();
    state.queue.close().await;
    state.review_events.close();
    state.import_events.close();
}
