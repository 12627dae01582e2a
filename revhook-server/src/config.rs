use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which `TaskQueue` implementation to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueBackend {
    /// Jobs run as tasks inside this process.
    Inline,
    /// Jobs go through a Redis list consumed by a worker pool.
    Redis { url: String },
}

#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub interval: Duration,
    /// Lease length for the sweep lock. Held until it expires.
    pub lock_ttl: Duration,
    pub max_attempts: u32,
    pub batch_size: usize,
    /// A pending or analyzing job untouched for this long is presumed
    /// abandoned and failed by the sweep.
    pub stale_after: Duration,
}

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub per_second: f64,
    pub burst: u32,
    pub idle_timeout: Duration,
    pub max_tracked_ips: usize,
    /// Take the client IP from `X-Forwarded-For` instead of the socket.
    pub trust_forwarded_for: bool,
}

#[derive(Debug, Clone)]
pub struct OpenAiSettings {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Directory for persistent state (SQLite database).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    /// JSON file listing the registered projects.
    pub projects_file: PathBuf,
    pub queue_backend: QueueBackend,
    pub queue_key: String,
    pub worker_count: usize,
    pub job_timeout: Duration,
    pub max_in_flight: usize,
    pub retry: RetrySettings,
    pub rate_limit: RateLimitSettings,
    /// HS256 secret for live-stream tokens. Streams are disabled when unset.
    pub stream_jwt_secret: Option<String>,
    /// Bearer token for `/api/jobs`. Those endpoints are disabled when unset.
    pub admin_token: Option<String>,
    pub openai: OpenAiSettings,
    pub review_chunk_chars: usize,
    /// Identifies this process as a lock owner.
    pub instance_id: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let port = parse_or(&lookup, "PORT", 3000u16)?;

        let state_dir = lookup("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let projects_file = lookup("PROJECTS_FILE")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .context("PROJECTS_FILE environment variable is required")?;

        let queue_backend = match lookup("QUEUE_BACKEND").as_deref().map(str::trim) {
            None | Some("") | Some("inline") => QueueBackend::Inline,
            Some("redis") => {
                let url = parse_secret(lookup("REDIS_URL"))
                    .context("REDIS_URL is required when QUEUE_BACKEND=redis")?;
                QueueBackend::Redis { url }
            }
            Some(other) => bail!("QUEUE_BACKEND must be 'inline' or 'redis', got '{}'", other),
        };

        let queue_key = lookup("QUEUE_KEY")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "revhook:jobs".to_string());

        let worker_count = parse_or(&lookup, "WORKER_COUNT", 4usize)?;
        if worker_count == 0 {
            bail!("WORKER_COUNT must be at least 1");
        }
        let job_timeout = Duration::from_secs(parse_or(&lookup, "JOB_TIMEOUT_SECS", 300u64)?);
        let max_in_flight = parse_or(&lookup, "MAX_IN_FLIGHT", 64usize)?;
        if max_in_flight == 0 {
            bail!("MAX_IN_FLIGHT must be at least 1");
        }

        let retry = RetrySettings {
            interval: Duration::from_secs(parse_or(&lookup, "RETRY_INTERVAL_SECS", 180u64)?),
            lock_ttl: Duration::from_secs(parse_or(&lookup, "RETRY_LOCK_TTL_SECS", 150u64)?),
            max_attempts: parse_or(&lookup, "RETRY_MAX_ATTEMPTS", 3u32)?,
            batch_size: parse_or(&lookup, "RETRY_BATCH_SIZE", 50usize)?,
            stale_after: job_timeout.saturating_mul(2),
        };
        if retry.batch_size == 0 {
            bail!("RETRY_BATCH_SIZE must be at least 1");
        }
        if retry.interval.is_zero() {
            bail!("RETRY_INTERVAL_SECS must be at least 1");
        }
        if retry.lock_ttl.is_zero() {
            bail!("RETRY_LOCK_TTL_SECS must be at least 1");
        }
        // The lease lapses before the next tick so any instance can run the next sweep.
        if retry.lock_ttl >= retry.interval {
            bail!(
                "RETRY_LOCK_TTL_SECS ({}) must be shorter than RETRY_INTERVAL_SECS ({})",
                retry.lock_ttl.as_secs(),
                retry.interval.as_secs()
            );
        }

        let rate_limit = RateLimitSettings {
            per_second: parse_or(&lookup, "RATE_LIMIT_PER_SEC", 5.0f64)?,
            burst: parse_or(&lookup, "RATE_LIMIT_BURST", 20u32)?,
            idle_timeout: Duration::from_secs(parse_or(&lookup, "RATE_LIMIT_IDLE_SECS", 600u64)?),
            max_tracked_ips: parse_or(&lookup, "RATE_LIMIT_MAX_IPS", 10_000usize)?,
            trust_forwarded_for: parse_or(&lookup, "TRUST_FORWARDED_FOR", false)?,
        };
        if rate_limit.per_second <= 0.0 || rate_limit.burst == 0 {
            bail!("RATE_LIMIT_PER_SEC and RATE_LIMIT_BURST must be positive");
        }
        if rate_limit.max_tracked_ips == 0 {
            bail!("RATE_LIMIT_MAX_IPS must be at least 1");
        }

        let openai = OpenAiSettings {
            api_key: parse_secret(lookup("OPENAI_API_KEY"))
                .context("OPENAI_API_KEY environment variable is required")?,
            model: lookup("OPENAI_MODEL")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            base_url: lookup("OPENAI_BASE_URL")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
        };

        let instance_id = lookup("INSTANCE_ID")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(default_instance_id);

        Ok(Config {
            port,
            state_dir,
            projects_file,
            queue_backend,
            queue_key,
            worker_count,
            job_timeout,
            max_in_flight,
            retry,
            rate_limit,
            stream_jwt_secret: parse_secret(lookup("STREAM_JWT_SECRET")),
            admin_token: parse_secret(lookup("ADMIN_TOKEN")),
            openai,
            review_chunk_chars: parse_or(&lookup, "REVIEW_CHUNK_CHARS", 60_000usize)?,
            instance_id,
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.state_dir.join("revhook.db")
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name).filter(|s| !s.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{} has an invalid value '{}'", name, raw)),
        None => Ok(default),
    }
}

/// Parse a secret from an optional string value.
///
/// Returns None if the value is missing, empty, or contains only whitespace,
/// so an empty secret can never authenticate anything.
pub fn parse_secret(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

fn default_instance_id() -> String {
    let host = env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}-{}", host, std::process::id())
}
