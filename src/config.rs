//! Configuration file parser.
//!
//! The config file is optional — a missing file yields `Config::default()`.
//! Unknown keys are accepted (serde default behavior) but logged as a warning.
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config file too large: {0}")]
    TooLarge(String),
}

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// Missing keys fall back to `Default::default()`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_path: String,
    /// Default lookback window, in days, for `GetRecentEntries`.
    pub days: i64,
    /// How many feeds to fetch concurrently. Clamped to [1, 50] at use.
    pub concurrent_fetch: usize,
    pub max_retries: u32,
    pub requests_per_minute: u32,
    pub rate_limit_burst: u32,
    pub user_agent: String,
    pub request_timeout_secs: u64,
    pub dial_timeout_secs: u64,
    pub tls_timeout_secs: u64,
    pub response_header_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_response_bytes: usize,
    /// Whether `GetRecentEntries`'s window filters on `first_seen` instead
    /// of `published`.
    pub filter_by_first_seen: bool,
    pub sort_by: String,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "./data/planet.db".to_owned(),
            days: 30,
            concurrent_fetch: 5,
            max_retries: 3,
            requests_per_minute: 60,
            rate_limit_burst: 10,
            user_agent: "rogue-planet/0.1 (+https://example.invalid/rogue-planet)".to_owned(),
            request_timeout_secs: 30,
            dial_timeout_secs: 10,
            tls_timeout_secs: 10,
            response_header_timeout_secs: 15,
            idle_timeout_secs: 90,
            max_response_bytes: 10 * 1024 * 1024,
            filter_by_first_seen: false,
            sort_by: "published".to_owned(),
            log_level: "info".to_owned(),
        }
    }
}

impl Config {
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: &'static [&'static str] = &[
        "database_path",
        "days",
        "concurrent_fetch",
        "max_retries",
        "requests_per_minute",
        "rate_limit_burst",
        "user_agent",
        "request_timeout_secs",
        "dial_timeout_secs",
        "tls_timeout_secs",
        "response_header_timeout_secs",
        "idle_timeout_secs",
        "max_response_bytes",
        "filter_by_first_seen",
        "sort_by",
        "log_level",
    ];

    /// Loads configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)`
    /// - Unknown keys → accepted, logged as a warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }
}
