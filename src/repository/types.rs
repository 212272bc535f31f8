use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("feed with url {0} already exists")]
    Duplicate(String),
    #[error("feed {0} not found")]
    NotFound(i64),
    #[error("migration failed: {0}")]
    Migration(String),
    #[error(transparent)]
    Other(#[from] sqlx::Error),
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Feed {
    pub id: i64,
    pub url: String,
    pub title: Option<String>,
    /// The feed's self-reported site link (not the feed URL itself).
    pub link: Option<String>,
    /// The feed's self-reported last-updated timestamp, distinct from
    /// `last_fetched_at` which tracks when *we* last fetched it.
    pub updated: Option<DateTime<Utc>>,
    pub active: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub fetch_error: Option<String>,
    pub fetch_error_count: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Entry {
    pub id: i64,
    pub feed_id: i64,
    pub entry_id: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
    pub content: Option<String>,
    pub summary: Option<String>,
    pub published: DateTime<Utc>,
    pub updated: Option<DateTime<Utc>>,
    pub first_seen: DateTime<Utc>,
}

/// Fields the caller may write back after a successful fetch/parse.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub entry_id: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
    pub content: Option<String>,
    pub summary: Option<String>,
    pub published: DateTime<Utc>,
    pub updated: Option<DateTime<Utc>>,
    pub first_seen: DateTime<Utc>,
}

/// Columns callers may sort `GetRecentEntries` by. Whitelisted to prevent
/// building dynamic SQL off of unvalidated input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    Published,
    FirstSeen,
}

impl SortBy {
    pub fn column(self) -> &'static str {
        match self {
            SortBy::Published => "published",
            SortBy::FirstSeen => "first_seen",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "published" => Some(SortBy::Published),
            "first_seen" => Some(SortBy::FirstSeen),
            _ => None,
        }
    }
}
