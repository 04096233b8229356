//! Per-client-IP token bucket limiting.

use std::{
    collections::HashMap,
    net::SocketAddr,
    num::NonZeroU32,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header::RETRY_AFTER, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::{config::RateLimitConfig, error::AppError};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

struct Bucket {
    limiter: DirectLimiter,
    last_seen: Mutex<Instant>,
}

impl Bucket {
    fn new(quota: Quota) -> Self {
        Self {
            limiter: RateLimiter::direct(quota),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_seen.lock())
    }
}

/// Token bucket per IP: `per_second` refill, `burst` capacity, created full on first sighting.
pub struct IpRateLimiter {
    buckets: RwLock<HashMap<String, Arc<Bucket>>>,
    quota: Quota,
    max_entries: usize,
    idle_ttl: Duration,
    trust_proxy_headers: bool,
}

impl IpRateLimiter {
    pub fn new(per_second: NonZeroU32, burst: NonZeroU32) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            quota: Quota::per_second(per_second).allow_burst(burst),
            max_entries: 10_000,
            idle_ttl: Duration::from_secs(600),
            trust_proxy_headers: false,
        }
    }

    pub fn from_config(cfg: &RateLimitConfig) -> anyhow::Result<Self> {
        let per_second = NonZeroU32::new(cfg.per_second)
            .ok_or_else(|| anyhow::anyhow!("rate limit per_second must be positive"))?;
        let burst = NonZeroU32::new(cfg.burst)
            .ok_or_else(|| anyhow::anyhow!("rate limit burst must be positive"))?;
        Ok(Self::new(per_second, burst)
            .with_eviction(cfg.max_entries.max(1), Duration::from_secs(cfg.idle_secs))
            .trust_proxy_headers(cfg.trust_proxy_headers))
    }

    pub fn with_eviction(mut self, max_entries: usize, idle_ttl: Duration) -> Self {
        self.max_entries = max_entries;
        self.idle_ttl = idle_ttl;
        self
    }

    pub fn trust_proxy_headers(mut self, trust: bool) -> Self {
        self.trust_proxy_headers = trust;
        self
    }

    fn bucket(&self, ip: &str) -> Arc<Bucket> {
        if let Some(bucket) = self.buckets.read().get(ip) {
            return bucket.clone();
        }

        let mut buckets = self.buckets.write();
        if buckets.len() >= self.max_entries && !buckets.contains_key(ip) {
            evict_least_recent(&mut buckets);
        }
        buckets
            .entry(ip.to_owned())
            .or_insert_with(|| Arc::new(Bucket::new(self.quota)))
            .clone()
    }

    /// Consumes one token for `ip` if available.
    pub fn allow(&self, ip: &str) -> bool {
        let bucket = self.bucket(ip);
        bucket.touch();
        bucket.limiter.check().is_ok()
    }

    /// Drops buckets idle longer than the configured TTL. Returns how many were removed.
    pub fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.write();
        let before = buckets.len();
        buckets.retain(|_, b| b.idle_for(now) < self.idle_ttl);
        let removed = before - buckets.len();
        if removed > 0 {
            debug!(removed, remaining = buckets.len(), "rate limiter swept idle buckets");
        }
        removed
    }

    pub fn idle_ttl(&self) -> Duration {
        self.idle_ttl
    }

    fn client_ip(&self, req: &Request) -> String {
        if self.trust_proxy_headers {
            let forwarded = req
                .headers()
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty());
            if let Some(ip) = forwarded {
                return ip.to_owned();
            }
        }
        req.extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_owned())
    }
}

fn evict_least_recent(buckets: &mut HashMap<String, Arc<Bucket>>) {
    let now = Instant::now();
    let oldest = buckets
        .iter()
        .max_by_key(|(_, b)| b.idle_for(now))
        .map(|(ip, _)| ip.clone());
    if let Some(ip) = oldest {
        buckets.remove(&ip);
        debug!(%ip, "rate limiter evicted least recently seen ip");
    }
}

/// Periodically drops idle buckets until the runtime shuts down.
pub fn spawn_sweeper(limiter: Arc<IpRateLimiter>) -> tokio::task::JoinHandle<()> {
    let period = (limiter.idle_ttl() / 2).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            limiter.sweep_idle();
        }
    })
}

pub async fn rate_limit(
    State(limiter): State<Arc<IpRateLimiter>>,
    req: Request,
    next: Next,
) -> Response {
    let ip = limiter.client_ip(&req);
    if limiter.allow(&ip) {
        return next.run(req).await;
    }

    warn!(%ip, path = %req.uri().path(), "rate limit exceeded");
    let mut res = AppError::TooManyRequests.into_response();
    res.headers_mut()
        .insert(RETRY_AFTER, HeaderValue::from_static("1"));
    res
}
