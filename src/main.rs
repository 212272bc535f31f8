use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rogue_planet::config::Config;
use rogue_planet::crawler::{Crawler, CrawlerConfig};
use rogue_planet::fetcher::{DefaultNormalizer, Fetcher};
use rogue_planet::orchestrator::{self, OrchestratorConfig};
use rogue_planet::ratelimit::{RateLimiter, RateLimiterConfig};
use rogue_planet::repository::Database;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config_path = PathBuf::from(
        std::env::var("ROGUE_PLANET_CONFIG").unwrap_or_else(|_| "rogue-planet.toml".to_owned()),
    );

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load config: {err}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(err) = run(config).await {
        tracing::error!(error = %err, "run failed");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let db = Database::open(&PathBuf::from(&config.database_path)).await?;

    let crawler_config = CrawlerConfig {
        user_agent: config.user_agent.clone(),
        request_timeout: Duration::from_secs(config.request_timeout_secs),
        dial_timeout: Duration::from_secs(config.dial_timeout_secs),
        tls_timeout: Duration::from_secs(config.tls_timeout_secs),
        response_header_timeout: Duration::from_secs(config.response_header_timeout_secs),
        idle_timeout: Duration::from_secs(config.idle_timeout_secs),
        max_response_bytes: config.max_response_bytes,
        ..CrawlerConfig::default()
    };
    let crawler = Crawler::new(crawler_config)?;

    let fetcher = Arc::new(Fetcher::new(
        crawler,
        DefaultNormalizer,
        db.clone(),
        orchestrator::new_write_lock(),
        config.max_retries,
    ));

    let rate_limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
        requests_per_minute: config.requests_per_minute,
        burst: config.rate_limit_burst,
    }));

    let feeds = db.get_active_feeds().await?;
    let cancel = CancellationToken::new();

    let results = orchestrator::run_with_signal_handling(
        orchestrator::run_cycle(
            fetcher,
            feeds,
            OrchestratorConfig {
                concurrency: config.concurrent_fetch,
            },
            rate_limiter,
            cancel.clone(),
        ),
        cancel,
    )
    .await?;

    let mut stored = 0usize;
    let mut not_modified = 0usize;
    let mut errored = 0usize;
    for result in &results {
        match &result.outcome {
            rogue_planet::fetcher::FetchOutcome::Stored(n) => stored += n,
            rogue_planet::fetcher::FetchOutcome::NotModified => not_modified += 1,
            rogue_planet::fetcher::FetchOutcome::Errored(reason) => {
                errored += 1;
                tracing::warn!(url = %result.url, reason, "feed fetch failed");
            }
        }
    }

    tracing::info!(
        feeds = results.len(),
        entries_stored = stored,
        not_modified,
        errored,
        "run complete"
    );

    Ok(())
}
