use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use revhook_server::config::{Config, QueueBackend};
use revhook_server::engine::OpenAiEngine;
use revhook_server::hub::{EventHub, DEFAULT_CLIENT_BUFFER};
use revhook_server::idempotency::IdempotencyGuard;
use revhook_server::ingest::WebhookIngestor;
use revhook_server::notify::WebhookNotifier;
use revhook_server::platform_client::HttpPlatformClient;
use revhook_server::processor::ReviewProcessor;
use revhook_server::projects::FileProjectRegistry;
use revhook_server::queue::{InlineQueue, RedisQueue, TaskQueue};
use revhook_server::rate_limit::RateLimiter;
use revhook_server::retry::RetryScheduler;
use revhook_server::routes::router;
use revhook_server::store::sqlite::SqliteStore;
use revhook_server::{shutdown_on, AppState};

const RATE_LIMIT_SWEEP: Duration = Duration::from_secs(60);

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(version = %revhook_server::version(), "Starting revhook");

    let config = Config::from_env().context("Failed to load configuration from environment")?;

    let db_path = config.database_path();
    info!("Using state database: {}", db_path.display());
    let store = Arc::new(SqliteStore::new(&db_path).context("Failed to open state database")?);

    let projects = Arc::new(
        FileProjectRegistry::load(&config.projects_file)
            .with_context(|| format!("Failed to load {}", config.projects_file.display()))?,
    );
    info!(count = projects.len(), "Loaded projects");

    let review_events = Arc::new(EventHub::new("reviews", DEFAULT_CLIENT_BUFFER));
    let import_events = Arc::new(EventHub::new("imports", DEFAULT_CLIENT_BUFFER));

    let http = reqwest::Client::builder()
        .user_agent(concat!("revhook/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(60))
        .build()
        .context("Failed to build HTTP client")?;

    let processor = Arc::new(ReviewProcessor::new(
        store.clone(),
        projects.clone(),
        Arc::new(HttpPlatformClient::new(http.clone())),
        Arc::new(OpenAiEngine::new(
            http.clone(),
            config.openai.clone(),
            config.review_chunk_chars,
        )),
        Arc::new(WebhookNotifier::new(http)),
        review_events.clone(),
    ));

    let queue: Arc<dyn TaskQueue> = match &config.queue_backend {
        QueueBackend::Inline => {
            let queue = Arc::new(InlineQueue::new(config.max_in_flight, config.job_timeout));
            queue.set_processor(processor.clone());
            queue
        }
        QueueBackend::Redis { url } => {
            let queue = Arc::new(RedisQueue::connect(
                url,
                &config.queue_key,
                &config.instance_id,
                config.worker_count,
                config.job_timeout,
            )?);
            queue.set_processor(processor.clone());
            queue.start().await.context("Failed to start Redis workers")?;
            queue
        }
    };
    info!(backend = queue.backend(), "Job queue ready");

    let shutdown = CancellationToken::new();

    let retry = Arc::new(RetryScheduler::new(
        store.clone(),
        store.clone(),
        queue.clone(),
        review_events.clone(),
        config.retry.clone(),
        config.instance_id.clone(),
    ));
    let retry_task = tokio::spawn(retry.clone().run(shutdown.clone()));

    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
    let sweeper = rate_limiter
        .clone()
        .spawn_sweeper(RATE_LIMIT_SWEEP, shutdown.clone());

    let state = Arc::new(AppState {
        projects: projects.clone(),
        store: store.clone(),
        ingestor: WebhookIngestor::new(
            projects.clone(),
            store.clone(),
            queue.clone(),
            review_events.clone(),
        ),
        guard: IdempotencyGuard::new(store.clone()),
        queue: queue.clone(),
        processor,
        retry,
        review_events: review_events.clone(),
        import_events: import_events.clone(),
        rate_limiter,
        stream_jwt_secret: config.stream_jwt_secret.clone(),
        admin_token: config.admin_token.clone(),
        job_timeout: config.job_timeout,
    });

    let app = router(state.clone());
    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_on(shutdown_signal(), shutdown, state))
    .await?;

    if let Err(e) = retry_task.await {
        error!("Retry scheduler task failed: {}", e);
    }
    if let Err(e) = sweeper.await {
        error!("Rate limit sweeper task failed: {}", e);
    }
    info!("Shutdown complete");

    Ok(())
}
