//! Fetches one feed end to end: HTTP, parse, store.
//!
//! The HTTP round trip and parsing both happen before any lock is taken —
//! only the store step (`upsert_entry`/`update_feed_*`) runs while holding
//! the write mutex, so a slow origin server never blocks other workers from
//! writing their own results.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::crawler::{CrawlerError, FeedCache, HttpResponse};
use crate::normalizer::{FeedMetadata, NormalizeError, NormalizedEntry};
use crate::repository::{Feed, NewEntry, RepositoryError};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Crawler(#[from] CrawlerError),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// New or updated entries were stored; the count is how many were seen
    /// in this fetch (not necessarily how many were new — a feed can report
    /// the same entries fetch after fetch).
    Stored(usize),
    NotModified,
    Errored(String),
}

/// Capability seam so [`Fetcher`] can be exercised with fakes in tests
/// without standing up a real HTTP server or database.
pub trait CrawlerLike {
    fn fetch_with_retry(
        &self,
        url: &str,
        cache: &FeedCache,
        max_retries: u32,
        cancel: &CancellationToken,
    ) -> impl std::future::Future<Output = Result<HttpResponse, CrawlerError>> + Send;
}

pub trait NormalizerLike {
    fn parse(
        &self,
        bytes: &[u8],
        feed_url: &str,
        fetch_time: chrono::DateTime<Utc>,
    ) -> Result<(FeedMetadata, Vec<NormalizedEntry>), NormalizeError>;
}

pub trait RepositoryLike {
    fn update_feed_error(
        &self,
        feed_id: i64,
        error: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
    fn update_feed_url(
        &self,
        feed_id: i64,
        new_url: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
    fn update_feed_cache(
        &self,
        feed_id: i64,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
    fn update_feed_metadata(
        &self,
        feed_id: i64,
        title: Option<&str>,
        link: Option<&str>,
        updated: Option<DateTime<Utc>>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
    fn upsert_entry(
        &self,
        feed_id: i64,
        entry: &NewEntry,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}

impl CrawlerLike for crate::crawler::Crawler {
    async fn fetch_with_retry(
        &self,
        url: &str,
        cache: &FeedCache,
        max_retries: u32,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, CrawlerError> {
        crate::crawler::Crawler::fetch_with_retry(self, url, cache, max_retries, cancel).await
    }
}

pub struct DefaultNormalizer;

impl NormalizerLike for DefaultNormalizer {
    fn parse(
        &self,
        bytes: &[u8],
        feed_url: &str,
        fetch_time: chrono::DateTime<Utc>,
    ) -> Result<(FeedMetadata, Vec<NormalizedEntry>), NormalizeError> {
        crate::normalizer::parse(bytes, feed_url, fetch_time)
    }
}

impl RepositoryLike for crate::repository::Database {
    async fn update_feed_error(&self, feed_id: i64, error: &str) -> Result<(), RepositoryError> {
        crate::repository::Database::update_feed_error(self, feed_id, error).await
    }
    async fn update_feed_url(&self, feed_id: i64, new_url: &str) -> Result<(), RepositoryError> {
        crate::repository::Database::update_feed_url(self, feed_id, new_url).await
    }
    async fn update_feed_cache(
        &self,
        feed_id: i64,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<(), RepositoryError> {
        crate::repository::Database::update_feed_cache(self, feed_id, etag, last_modified).await
    }
    async fn update_feed_metadata(
        &self,
        feed_id: i64,
        title: Option<&str>,
        link: Option<&str>,
        updated: Option<DateTime<Utc>>,
    ) -> Result<(), RepositoryError> {
        crate::repository::Database::update_feed_metadata(self, feed_id, title, link, updated).await
    }
    async fn upsert_entry(&self, feed_id: i64, entry: &NewEntry) -> Result<(), RepositoryError> {
        crate::repository::Database::upsert_entry(self, feed_id, entry).await
    }
}

pub struct Fetcher<C, N, R> {
    crawler: C,
    normalizer: N,
    repository: R,
    write_lock: Arc<Mutex<()>>,
    max_retries: u32,
}

impl<C, N, R> Fetcher<C, N, R>
where
    C: CrawlerLike,
    N: NormalizerLike,
    R: RepositoryLike,
{
    pub fn new(
        crawler: C,
        normalizer: N,
        repository: R,
        write_lock: Arc<Mutex<()>>,
        max_retries: u32,
    ) -> Self {
        Self {
            crawler,
            normalizer,
            repository,
            write_lock,
            max_retries,
        }
    }

    pub async fn fetch_feed(&self, feed: &Feed, cancel: &CancellationToken) -> FetchOutcome {
        match self.fetch_feed_inner(feed, cancel).await {
            Ok(outcome) => outcome,
            Err(err) => {
                let message = err.to_string();
                let _ = self.repository.update_feed_error(feed.id, &message).await;
                FetchOutcome::Errored(message)
            }
        }
    }

    async fn fetch_feed_inner(
        &self,
        feed: &Feed,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, FetchError> {
        let cache = FeedCache {
            etag: feed.etag.clone(),
            last_modified: feed.last_modified.clone(),
        };

        // Step 1-2: HTTP round trip, entirely outside the write lock.
        let response = self
            .crawler
            .fetch_with_retry(&feed.url, &cache, self.max_retries, cancel)
            .await?;

        if response.not_modified {
            let _guard = self.write_lock.lock().await;
            self.repository
                .update_feed_cache(feed.id, response.etag.as_deref(), response.last_modified.as_deref())
                .await?;
            return Ok(FetchOutcome::NotModified);
        }

        let fetch_time = Utc::now();

        // Step 3: parse, also outside the write lock.
        let (metadata, entries) = self.normalizer.parse(&response.body, &feed.url, fetch_time)?;

        // Step 4-6: store. Only this section holds the write lock.
        let _guard = self.write_lock.lock().await;

        if let Some(permanent_url) = &response.permanent_redirect_to {
            self.repository.update_feed_url(feed.id, permanent_url).await?;
        }

        self.repository
            .update_feed_metadata(feed.id, metadata.title.as_deref(), metadata.link.as_deref(), metadata.updated)
            .await?;

        let count = entries.len();
        for entry in &entries {
            self.repository.upsert_entry(feed.id, &to_new_entry(entry)).await?;
        }

        self.repository
            .update_feed_cache(feed.id, response.etag.as_deref(), response.last_modified.as_deref())
            .await?;

        Ok(FetchOutcome::Stored(count))
    }
}

fn to_new_entry(entry: &NormalizedEntry) -> NewEntry {
    NewEntry {
        entry_id: entry.entry_id.clone(),
        title: entry.title.clone(),
        link: entry.link.clone(),
        author: entry.author.clone(),
        content: entry.content.clone(),
        summary: entry.summary.clone(),
        published: entry.published,
        updated: entry.updated,
        first_seen: entry.first_seen,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct FakeCrawler {
        response: StdMutex<Option<Result<HttpResponse, String>>>,
    }

    impl CrawlerLike for FakeCrawler {
        async fn fetch_with_retry(
            &self,
            _url: &str,
            _cache: &FeedCache,
            _max_retries: u32,
            _cancel: &CancellationToken,
        ) -> Result<HttpResponse, CrawlerError> {
            match self.response.lock().unwrap().take() {
                Some(Ok(resp)) => Ok(resp),
                Some(Err(_)) => Err(CrawlerError::Timeout),
                None => panic!("fake crawler called more than once"),
            }
        }
    }

    struct FakeNormalizer;
    impl NormalizerLike for FakeNormalizer {
        fn parse(
            &self,
            _bytes: &[u8],
            _feed_url: &str,
            fetch_time: chrono::DateTime<Utc>,
        ) -> Result<(FeedMetadata, Vec<NormalizedEntry>), NormalizeError> {
            Ok((
                FeedMetadata {
                    title: Some("Fake Feed".into()),
                    link: None,
                    updated: None,
                },
                vec![NormalizedEntry {
                    entry_id: "1".into(),
                    title: Some("Entry".into()),
                    link: None,
                    author: None,
                    content: None,
                    summary: None,
                    published: fetch_time,
                    updated: None,
                    first_seen: fetch_time,
                }],
            ))
        }
    }

    #[derive(Default)]
    struct FakeRepository {
        errors: AtomicUsize,
        upserts: AtomicUsize,
        cache_updates: AtomicUsize,
    }

    impl RepositoryLike for FakeRepository {
        async fn update_feed_error(&self, _feed_id: i64, _error: &str) -> Result<(), RepositoryError> {
            self.errors.fetch_add(1, Ordering::SeqCst);
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
            self.cache_updates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn update_feed_metadata(
            &self,
            _feed_id: i64,
            _title: Option<&str>,
            _link: Option<&str>,
            _updated: Option<DateTime<Utc>>,
        ) -> Result<(), RepositoryError> {
            Ok(())
        }
        async fn upsert_entry(&self, _feed_id: i64, _entry: &NewEntry) -> Result<(), RepositoryError> {
            self.upserts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_feed() -> Feed {
        Feed {
            id: 1,
            url: "https://example.com/feed.xml".into(),
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

    fn ok_response() -> HttpResponse {
        HttpResponse {
            status: reqwest::StatusCode::OK,
            body: b"<rss></rss>".to_vec(),
            etag: Some("\"abc\"".into()),
            last_modified: None,
            final_url: None,
            permanent_redirect_to: None,
            not_modified: false,
        }
    }

    #[tokio::test]
    async fn stores_entries_on_success() {
        let crawler = FakeCrawler {
            response: StdMutex::new(Some(Ok(ok_response()))),
        };
        let repo = FakeRepository::default();
        let fetcher = Fetcher::new(crawler, FakeNormalizer, repo, Arc::new(Mutex::new(())), 3);

        let outcome = fetcher.fetch_feed(&test_feed(), &CancellationToken::new()).await;

        assert_eq!(outcome, FetchOutcome::Stored(1));
        assert_eq!(fetcher.repository.upserts.load(Ordering::SeqCst), 1);
        assert_eq!(fetcher.repository.cache_updates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn not_modified_response_skips_parse_and_upsert() {
        let mut resp = ok_response();
        resp.not_modified = true;
        resp.body = Vec::new();
        let crawler = FakeCrawler {
            response: StdMutex::new(Some(Ok(resp))),
        };
        let repo = FakeRepository::default();
        let fetcher = Fetcher::new(crawler, FakeNormalizer, repo, Arc::new(Mutex::new(())), 3);

        let outcome = fetcher.fetch_feed(&test_feed(), &CancellationToken::new()).await;

        assert_eq!(outcome, FetchOutcome::NotModified);
        assert_eq!(fetcher.repository.upserts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn crawler_failure_records_feed_error() {
        let crawler = FakeCrawler {
            response: StdMutex::new(Some(Err("boom".into()))),
        };
        let repo = FakeRepository::default();
        let fetcher = Fetcher::new(crawler, FakeNormalizer, repo, Arc::new(Mutex::new(())), 3);

        let outcome = fetcher.fetch_feed(&test_feed(), &CancellationToken::new()).await;

        assert!(matches!(outcome, FetchOutcome::Errored(_)));
        assert_eq!(fetcher.repository.errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_reaches_the_crawler_seam() {
        struct CancelSpy {
            saw_cancelled: AtomicUsize,
        }
        impl CrawlerLike for CancelSpy {
            async fn fetch_with_retry(
                &self,
                _url: &str,
                _cache: &FeedCache,
                _max_retries: u32,
                cancel: &CancellationToken,
            ) -> Result<HttpResponse, CrawlerError> {
                if cancel.is_cancelled() {
                    self.saw_cancelled.fetch_add(1, Ordering::SeqCst);
                }
                Err(CrawlerError::Timeout)
            }
        }

        let crawler = CancelSpy { saw_cancelled: AtomicUsize::new(0) };
        let repo = FakeRepository::default();
        let fetcher = Fetcher::new(crawler, FakeNormalizer, repo, Arc::new(Mutex::new(())), 3);

        let cancel = CancellationToken::new();
        cancel.cancel();
        fetcher.fetch_feed(&test_feed(), &cancel).await;

        assert_eq!(fetcher.crawler.saw_cancelled.load(Ordering::SeqCst), 1);
    }
}
