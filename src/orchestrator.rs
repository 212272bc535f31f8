//! Fans a feed-refresh run out across a bounded worker pool and reports
//! each feed's outcome as it completes.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fetcher::{CrawlerLike, Fetcher, FetchOutcome, NormalizerLike, RepositoryLike};
use crate::ratelimit::RateLimiter;
use crate::repository::Feed;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("run was cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct FeedResult {
    pub feed_id: i64,
    pub url: String,
    pub outcome: FetchOutcome,
}

pub struct OrchestratorConfig {
    /// Number of feeds fetched concurrently. Clamped to [1, 50].
    pub concurrency: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { concurrency: 5 }
    }
}

/// Runs one refresh cycle over `feeds`, fetching up to `concurrency` of them
/// at a time. Cancelling `cancel` (e.g. on SIGINT/SIGTERM) stops launching
/// new fetches; in-flight fetches are allowed to finish so a feed's state
/// is never left half-written.
pub async fn run_cycle<C, N, R>(
    fetcher: Arc<Fetcher<C, N, R>>,
    feeds: Vec<Feed>,
    config: OrchestratorConfig,
    rate_limiter: Arc<RateLimiter>,
    cancel: CancellationToken,
) -> Result<Vec<FeedResult>, OrchestratorError>
where
    C: CrawlerLike + Send + Sync + 'static,
    N: NormalizerLike + Send + Sync + 'static,
    R: RepositoryLike + Send + Sync + 'static,
{
    let concurrency = config.concurrency.clamp(1, 50);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let (tx, mut rx) = mpsc::channel(feeds.len().max(1));

    info!(feed_count = feeds.len(), concurrency, "starting refresh cycle");

    let mut handles = Vec::with_capacity(feeds.len());
    for feed in feeds {
        if cancel.is_cancelled() {
            break;
        }

        let semaphore = semaphore.clone();
        let fetcher = fetcher.clone();
        let rate_limiter = rate_limiter.clone();
        let tx = tx.clone();
        let worker_cancel = cancel.child_token();

        let handle = tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire().await else {
                return;
            };
            if worker_cancel.is_cancelled() {
                return;
            }

            if rate_limiter.wait(&feed.url, &worker_cancel).await.is_err() {
                debug!(feed_id = feed.id, "rate-limit wait cancelled, skipping fetch");
                return;
            }

            let outcome = fetcher.fetch_feed(&feed, &worker_cancel).await;
            let result = FeedResult {
                feed_id: feed.id,
                url: feed.url.clone(),
                outcome,
            };
            let _ = tx.send(result).await;
        });
        handles.push(handle);
    }
    drop(tx);

    let mut results = Vec::with_capacity(handles.len());
    while let Some(result) = rx.recv().await {
        results.push(result);
    }

    for handle in handles {
        if let Err(err) = handle.await {
            warn!(error = %err, "worker task panicked");
        }
    }

    if cancel.is_cancelled() {
        info!(completed = results.len(), "refresh cycle cancelled, returning partial results");
    } else {
        info!(completed = results.len(), "refresh cycle complete");
    }

    Ok(results)
}

/// Races `work` against an OS interrupt signal. On Unix this listens for
/// both SIGINT and SIGTERM; elsewhere (tests, non-Unix targets) only
/// `ctrl_c` is available.
pub async fn run_with_signal_handling<F>(work: F, cancel: CancellationToken) -> F::Output
where
    F: std::future::Future,
{
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

        tokio::pin!(work);
        tokio::select! {
            output = &mut work => output,
            _ = tokio::signal::ctrl_c() => {
                warn!("received SIGINT, cancelling in-flight work");
                cancel.cancel();
                work.await
            }
            _ = sigterm.recv() => {
                warn!("received SIGTERM, cancelling in-flight work");
                cancel.cancel();
                work.await
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::pin!(work);
        tokio::select! {
            output = &mut work => output,
            _ = tokio::signal::ctrl_c() => {
                warn!("received interrupt, cancelling in-flight work");
                cancel.cancel();
                work.await
            }
        }
    }
}

pub fn new_write_lock() -> Arc<Mutex<()>> {
    Arc::new(Mutex::new(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::{CrawlerError, FeedCache, HttpResponse};
    use crate::normalizer::{FeedMetadata, NormalizeError, NormalizedEntry};
    use crate::ratelimit::RateLimiterConfig;
    use crate::repository::{Database, NewEntry, RepositoryError};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// A rate limiter wide open enough that it never perturbs the timing
    /// assertions these tests make about the worker pool itself.
    fn unlimited_rate_limiter() -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(RateLimiterConfig {
            requests_per_minute: 1_000_000,
            burst: 1_000_000,
        }))
    }

    struct SlowCrawler {
        delay: Duration,
        calls: Arc<AtomicUsize>,
    }

    impl CrawlerLike for SlowCrawler {
        async fn fetch_with_retry(
            &self,
            _url: &str,
            _cache: &FeedCache,
            _max_retries: u32,
            _cancel: &CancellationToken,
        ) -> Result<HttpResponse, CrawlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(HttpResponse {
                status: reqwest::StatusCode::OK,
                body: b"<rss></rss>".to_vec(),
                etag: None,
                last_modified: None,
                final_url: None,
                permanent_redirect_to: None,
                not_modified: false,
            })
        }
    }

    struct EmptyNormalizer;
    impl NormalizerLike for EmptyNormalizer {
        fn parse(
            &self,
            _bytes: &[u8],
            _feed_url: &str,
            _fetch_time: chrono::DateTime<Utc>,
        ) -> Result<(FeedMetadata, Vec<NormalizedEntry>), NormalizeError> {
            Ok((
                FeedMetadata {
                    title: None,
                    link: None,
                    updated: None,
                },
                Vec::new(),
            ))
        }
    }

    #[derive(Clone)]
    struct NoopRepository;
    impl RepositoryLike for NoopRepository {
        async fn update_feed_error(&self, _feed_id: i64, _error: &str) -> Result<(), RepositoryError> {
            Ok(())
        }
        async fn update_feed_url(&self, _feed_id: i64, _new_url: &str) -> Result<(), RepositoryError> {
            Ok(())
        }
        async fn update_feed_cache(
            &self,
            _feed_id: i64,
            _etag: Option<&str>,
            _last_modified: Option<&str>,
        ) -> Result<(), RepositoryError> {
            Ok(())
        }
        async fn update_feed_metadata(
            &self,
            _feed_id: i64,
            _title: Option<&str>,
            _link: Option<&str>,
            _updated: Option<chrono::DateTime<Utc>>,
        ) -> Result<(), RepositoryError> {
            Ok(())
        }
        async fn upsert_entry(&self, _feed_id: i64, _entry: &NewEntry) -> Result<(), RepositoryError> {
            Ok(())
        }
    }

    fn feed(id: i64) -> Feed {
        Feed {
            id,
            url: format!("https://example.com/{id}.xml"),
            title: None,
            link: None,
            updated: None,
            active: true,
            etag: None,
            last_modified: None,
            created_at: Utc::now(),
            last_fetched_at: None,
            fetch_error: None,
            fetch_error_count: 0,
        }
    }

    #[tokio::test]
    async fn runs_all_feeds_and_collects_results() {
        let calls = Arc::new(AtomicUsize::new(0));
        let crawler = SlowCrawler {
            delay: Duration::from_millis(5),
            calls: calls.clone(),
        };
        let fetcher = Arc::new(Fetcher::new(crawler, EmptyNormalizer, NoopRepository, new_write_lock(), 3));

        let feeds: Vec<Feed> = (0..10).map(feed).collect();
        let cancel = CancellationToken::new();
        let results = run_cycle(
            fetcher,
            feeds,
            OrchestratorConfig { concurrency: 3 },
            unlimited_rate_limiter(),
            cancel,
        )
        .await
        .unwrap();

        assert_eq!(results.len(), 10);
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn cancellation_stops_launching_new_fetches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let crawler = SlowCrawler {
            delay: Duration::from_millis(50),
            calls: calls.clone(),
        };
        let fetcher = Arc::new(Fetcher::new(crawler, EmptyNormalizer, NoopRepository, new_write_lock(), 3));

        let feeds: Vec<Feed> = (0..20).map(feed).collect();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let results = run_cycle(
            fetcher,
            feeds,
            OrchestratorConfig { concurrency: 5 },
            unlimited_rate_limiter(),
            cancel,
        )
        .await
        .unwrap();

        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn concurrency_is_clamped_to_configured_bound() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_observed = Arc::new(AtomicUsize::new(0));

        struct TrackingCrawler {
            in_flight: Arc<AtomicUsize>,
            max_observed: Arc<AtomicUsize>,
        }
        impl CrawlerLike for TrackingCrawler {
            async fn fetch_with_retry(
                &self,
                _url: &str,
                _cache: &FeedCache,
                _max_retries: u32,
                _cancel: &CancellationToken,
            ) -> Result<HttpResponse, CrawlerError> {
                let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_observed.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(HttpResponse {
                    status: reqwest::StatusCode::OK,
                    body: b"<rss></rss>".to_vec(),
                    etag: None,
                    last_modified: None,
                    final_url: None,
                    permanent_redirect_to: None,
                    not_modified: false,
                })
            }
        }

        let crawler = TrackingCrawler {
            in_flight: in_flight.clone(),
            max_observed: max_observed.clone(),
        };
        let fetcher = Arc::new(Fetcher::new(crawler, EmptyNormalizer, NoopRepository, new_write_lock(), 3));

        let feeds: Vec<Feed> = (0..20).map(feed).collect();
        run_cycle(
            fetcher,
            feeds,
            OrchestratorConfig { concurrency: 4 },
            unlimited_rate_limiter(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(max_observed.load(Ordering::SeqCst) <= 4);
    }

    #[test]
    fn use_database_type_in_bounds() {
        fn assert_repository_like<R: RepositoryLike>() {}
        assert_repository_like::<Database>();
    }

    #[tokio::test]
    async fn exhausted_rate_limiter_is_waited_on_before_fetching() {
        let calls = Arc::new(AtomicUsize::new(0));
        let crawler = SlowCrawler {
            delay: Duration::from_millis(1),
            calls: calls.clone(),
        };
        let fetcher = Arc::new(Fetcher::new(crawler, EmptyNormalizer, NoopRepository, new_write_lock(), 3));

        // A single-token bucket with a slow refill: the second feed's fetch
        // can only start once the worker has actually waited on the limiter.
        let rate_limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
            requests_per_minute: 6000,
            burst: 1,
        }));

        let feeds: Vec<Feed> = (0..2).map(feed).collect();
        let results = run_cycle(
            fetcher,
            feeds,
            OrchestratorConfig { concurrency: 2 },
            rate_limiter,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
