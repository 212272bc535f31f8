//! Per-host token-bucket rate limiting.
//!
//! One bucket per host, created lazily on first use and shared across every
//! worker task. `wait` blocks (cooperatively, respecting cancellation) until
//! a token is available; `allow` is the non-blocking variant used by tests
//! and admin tooling. A URL that fails to parse fails open — the crawler's
//! own SSRF validation is responsible for rejecting bad URLs, not the rate
//! limiter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    pub requests_per_minute: u32,
    pub burst: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            burst: 10,
        }
    }
}

struct Bucket {
    tokens: f64,
    max_tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(cfg: RateLimiterConfig) -> Self {
        Self {
            tokens: cfg.burst as f64,
            max_tokens: cfg.burst as f64,
            refill_per_sec: cfg.requests_per_minute as f64 / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.max_tokens);
        self.last_refill = now;
    }

    /// Attempts to take a token without blocking. Returns `None` on success,
    /// or `Some(delay)` — the time until a token would be available — on failure.
    fn try_take(&mut self) -> Option<Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            let deficit = 1.0 - self.tokens;
            Some(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }
}

/// Shared, host-keyed token-bucket rate limiter.
pub struct RateLimiter {
    config: RateLimiterConfig,
    buckets: RwLock<HashMap<String, Arc<tokio::sync::Mutex<Bucket>>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    fn host_of(url: &str) -> Option<String> {
        Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_owned))
    }

    async fn bucket_for(&self, host: &str) -> Arc<tokio::sync::Mutex<Bucket>> {
        if let Some(bucket) = self.buckets.read().await.get(host) {
            return bucket.clone();
        }

        // Double-checked insertion: another task may have created the bucket
        // between the read-lock probe above and acquiring the write lock.
        let mut buckets = self.buckets.write().await;
        buckets
            .entry(host.to_owned())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(Bucket::new(self.config))))
            .clone()
    }

    /// Non-blocking check: would a request to `url` be allowed right now?
    /// A URL that fails to parse fails open (returns `true`).
    pub async fn allow(&self, url: &str) -> bool {
        let Some(host) = Self::host_of(url) else {
            return true;
        };
        let bucket = self.bucket_for(&host).await;
        let mut bucket = bucket.lock().await;
        bucket.try_take().is_none()
    }

    /// Blocks until a token for `url`'s host is available, or until
    /// `cancel` fires. A URL that fails to parse fails open immediately.
    pub async fn wait(&self, url: &str, cancel: &CancellationToken) -> Result<(), Cancelled> {
        let Some(host) = Self::host_of(url) else {
            return Ok(());
        };

        loop {
            let bucket = self.bucket_for(&host).await;
            let delay = {
                let mut bucket = bucket.lock().await;
                bucket.try_take()
            };

            match delay {
                None => return Ok(()),
                Some(delay) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = cancel.cancelled() => return Err(Cancelled),
                    }
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct Cancelled;
