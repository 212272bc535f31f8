//! HTTP fetching with conditional requests, redirect tracking, retry with
//! backoff, and SSRF protection.

mod ssrf;

pub use ssrf::SsrfError;

use std::time::Duration;

use rand::Rng;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Cache validators carried forward from a feed's last successful fetch.
/// Both fields are opaque: whatever bytes the origin server sent back are
/// the bytes we send on the next conditional request, byte-for-byte.
#[derive(Debug, Clone, Default)]
pub struct FeedCache {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// Final URL after following redirects, if it differs from the request URL.
    pub final_url: Option<String>,
    /// Set when a 301 or 308 redirect was observed anywhere in the chain —
    /// callers should persist this as the feed's new canonical URL.
    pub permanent_redirect_to: Option<String>,
    pub not_modified: bool,
}

#[derive(Debug, Error)]
pub enum CrawlerError {
    #[error(transparent)]
    Ssrf(#[from] SsrfError),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("request timed out")]
    Timeout,
    #[error("server returned status {0}")]
    Status(u16),
    #[error("server returned retryable status {status}, retry after {retry_after:?}")]
    Retryable {
        status: u16,
        retry_after: Option<Duration>,
    },
    #[error("response exceeded maximum size of {0} bytes")]
    TooLarge(usize),
    #[error("too many redirects")]
    TooManyRedirects,
}

#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    pub user_agent: String,
    pub request_timeout: Duration,
    pub dial_timeout: Duration,
    pub tls_timeout: Duration,
    pub response_header_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_response_bytes: usize,
    pub max_idle_per_host: usize,
    pub max_redirects: u8,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            user_agent: "rogue-planet/0.1 (+https://example.invalid/rogue-planet)".to_owned(),
            request_timeout: Duration::from_secs(30),
            dial_timeout: Duration::from_secs(10),
            tls_timeout: Duration::from_secs(10),
            response_header_timeout: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(90),
            max_response_bytes: 10 * 1024 * 1024,
            max_idle_per_host: 10,
            max_redirects: 10,
        }
    }
}

/// Fetches feed documents over HTTP(S), enforcing SSRF protection on every
/// hop, honoring conditional-request caching, and bounding response size.
///
/// Redirects are followed manually (not via reqwest's built-in policy) so
/// that every hop can be re-validated against [`ssrf::validate_url`] and
/// 301/308 hops can be reported back to the caller for URL rewriting.
pub struct Crawler {
    client: Client,
    config: CrawlerConfig,
}

impl Crawler {
    pub fn new(config: CrawlerConfig) -> Result<Self, CrawlerError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.dial_timeout)
            .timeout(config.request_timeout)
            .pool_idle_timeout(config.idle_timeout)
            .pool_max_idle_per_host(config.max_idle_per_host)
            .redirect(reqwest::redirect::Policy::none())
            .gzip(true)
            .build()?;

        Ok(Self { client, config })
    }

    /// Fetches `url` once, following redirects manually up to the configured
    /// limit. Every hop is SSRF-validated (scheme, literal IP, and DNS
    /// resolution) before the request is issued.
    pub async fn fetch(&self, url: &str, cache: &FeedCache) -> Result<HttpResponse, CrawlerError> {
        let mut current = url.to_owned();
        let mut permanent_redirect_to = None;
        let mut final_url = None;

        for _ in 0..=self.config.max_redirects {
            let validated = ssrf::validate_url(&current)?;
            let host = validated.host_str().ok_or(SsrfError::MissingHost)?;
            let port = validated.port_or_known_default().unwrap_or(443);
            ssrf::resolve_and_check(host, port).await?;

            let mut req = self.client.get(validated.clone());
            if let Some(etag) = &cache.etag {
                req = req.header(reqwest::header::IF_NONE_MATCH, etag);
            }
            if let Some(last_modified) = &cache.last_modified {
                req = req.header(reqwest::header::IF_MODIFIED_SINCE, last_modified);
            }

            let resp = req.send().await.map_err(|e| {
                if e.is_timeout() {
                    CrawlerError::Timeout
                } else {
                    CrawlerError::Network(e)
                }
            })?;

            let status = resp.status();

            if status.is_redirection() {
                let location = resp
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned)
                    .ok_or(CrawlerError::Status(status.as_u16()))?;

                let next = validated
                    .join(&location)
                    .map_err(|e| SsrfError::InvalidUrl(e.to_string()))?;

                if status == StatusCode::MOVED_PERMANENTLY || status == StatusCode::PERMANENT_REDIRECT {
                    permanent_redirect_to = Some(next.to_string());
                }

                final_url = Some(next.to_string());
                current = next.to_string();
                continue;
            }

            if status == StatusCode::NOT_MODIFIED {
                return Ok(HttpResponse {
                    status,
                    body: Vec::new(),
                    etag: cache.etag.clone(),
                    last_modified: cache.last_modified.clone(),
                    final_url,
                    permanent_redirect_to,
                    not_modified: true,
                });
            }

            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                let retry_after = parse_retry_after(resp.headers());
                return Err(CrawlerError::Retryable {
                    status: status.as_u16(),
                    retry_after,
                });
            }

            if status.is_client_error() {
                return Err(CrawlerError::Status(status.as_u16()));
            }

            let etag = header_str(&resp, reqwest::header::ETAG);
            let last_modified = header_str(&resp, reqwest::header::LAST_MODIFIED);

            let max = self.config.max_response_bytes;
            let body = read_bounded(resp, max).await?;

            return Ok(HttpResponse {
                status,
                body,
                etag,
                last_modified,
                final_url,
                permanent_redirect_to,
                not_modified: false,
            });
        }

        Err(CrawlerError::TooManyRedirects)
    }

    /// Fetches with exponential backoff and jitter on retryable failures
    /// (429, 5xx, network/timeout errors). Honors a server `Retry-After`
    /// header as an override of the computed backoff. Aborts early if
    /// `cancel` fires during a backoff sleep.
    pub async fn fetch_with_retry(
        &self,
        url: &str,
        cache: &FeedCache,
        max_retries: u32,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, CrawlerError> {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(30);

        let mut attempt = 0;
        loop {
            match self.fetch(url, cache).await {
                Ok(resp) => return Ok(resp),
                Err(err) if attempt >= max_retries => return Err(err),
                Err(CrawlerError::Retryable { retry_after, .. }) => {
                    let delay = retry_after.unwrap_or_else(|| backoff_delay(attempt, base, cap));
                    attempt += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(CrawlerError::Timeout),
                    }
                }
                Err(CrawlerError::Network(_)) | Err(CrawlerError::Timeout) => {
                    let delay = backoff_delay(attempt, base, cap);
                    attempt += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(CrawlerError::Timeout),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(10));
    let capped = exp.min(cap);
    let jitter_ms = rand::rng().random_range(0..=capped.as_millis().max(1) as u64 / 4);
    capped.saturating_add(Duration::from_millis(jitter_ms))
}

/// Parses a `Retry-After` header, accepting either the delay-seconds form
/// or an HTTP-date (RFC 1123/RFC 2822-shaped, e.g. `Wed, 21 Oct 2015
/// 07:28:00 GMT`). A date in the past yields `None` so the caller falls
/// back to computed backoff instead of retrying with a negative delay.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    let value = value.trim();

    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let when = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    (when.with_timezone(&chrono::Utc) - chrono::Utc::now()).to_std().ok()
}

fn header_str(resp: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    resp.headers().get(name)?.to_str().ok().map(str::to_owned)
}

async fn read_bounded(resp: reqwest::Response, max: usize) -> Result<Vec<u8>, CrawlerError> {
    use futures::StreamExt;

    let mut body = Vec::new();
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(CrawlerError::Network)?;
        if body.len() + chunk.len() > max {
            return Err(CrawlerError::TooLarge(max));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}
