//! Per-client-IP admission control for the ingestion endpoints.
//!
//! Each IP gets a token bucket refilled at `per_second` up to `burst`.
//! Buckets are created on first sight and evicted by a background sweep once
//! idle for `idle_timeout`. `max_tracked_ips` bounds memory against spoofed
//! source addresses: when full, an unseen IP is rejected until the sweep (or
//! a forced cleanup) frees room.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RateLimitSettings;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

pub struct RateLimiter {
    settings: RateLimitSettings,
    buckets: RwLock<HashMap<IpAddr, Bucket>>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Spend one token for `ip`. Returns `false` when the request must be refused.
    pub fn allow(&self, ip: IpAddr) -> bool {
        self.allow_at(ip, Instant::now())
    }

    fn allow_at(&self, ip: IpAddr, now: Instant) -> bool {
        let mut buckets = self
            .buckets
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if !buckets.contains_key(&ip) && buckets.len() >= self.settings.max_tracked_ips {
            let cutoff = self.idle_cutoff(now);
            buckets.retain(|_, b| b.last_seen > cutoff);
            if buckets.len() >= self.settings.max_tracked_ips {
                warn!(
                    ip = %ip,
                    tracked_ips = buckets.len(),
                    "Rejecting new IP: tracked IP limit reached"
                );
                return false;
            }
        }

        let burst = f64::from(self.settings.burst);
        let bucket = buckets.entry(ip).or_insert(Bucket {
            tokens: burst,
            last_refill: now,
            last_seen: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.settings.per_second).min(burst);
        bucket.last_refill = now;
        bucket.last_seen = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn idle_cutoff(&self, now: Instant) -> Instant {
        now.checked_sub(self.settings.idle_timeout).unwrap_or(now)
    }

    /// Drop buckets idle longer than the configured window. Returns how many.
    pub fn evict_idle(&self) -> usize {
        self.evict_idle_at(Instant::now())
    }

    fn evict_idle_at(&self, now: Instant) -> usize {
        let cutoff = self.idle_cutoff(now);
        let mut buckets = self
            .buckets
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = buckets.len();
        buckets.retain(|_, b| b.last_seen > cutoff);
        before - buckets.len()
    }

    pub fn tracked_ips(&self) -> usize {
        self.buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Run [`evict_idle`](Self::evict_idle) every `every` until cancelled.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        every: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let evicted = self.evict_idle();
                        if evicted > 0 {
                            debug!(
                                evicted,
                                remaining = self.tracked_ips(),
                                "Evicted idle rate-limit buckets"
                            );
                        }
                    }
                }
            }
        })
    }

    /// Work out which IP a request counts against.
    pub fn client_ip(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> IpAddr {
        if self.settings.trust_forwarded_for {
            let forwarded = headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .and_then(|first| first.trim().parse::<IpAddr>().ok());
            if let Some(ip) = forwarded {
                return ip;
            }
        }
        peer.map(|addr| addr.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
}

/// Axum middleware refusing over-limit clients with 429.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ip = limiter.client_ip(request.headers(), peer);

    if !limiter.allow(ip) {
        warn!(ip = %ip, path = %request.uri().path(), "Rate limit exceeded");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({ "error": "Too many requests" })),
        )
            .into_response();
    }

    next.run(request).await
}
