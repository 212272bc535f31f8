//! Format-agnostic feed parsing: RSS 2.0, Atom, and JSON Feed all flow
//! through `feed_rs::parser`, then get mapped onto a single canonical shape
//! and sanitized.

mod sanitize;

pub use sanitize::sanitize_html;

use sanitize::sanitize_text_only;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::util::strip_control_chars;

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("failed to parse feed document: {0}")]
    Parse(#[from] feed_rs::parser::ParseFeedError),
}

#[derive(Debug, Clone)]
pub struct FeedMetadata {
    pub title: Option<String>,
    pub link: Option<String>,
    /// The feed's self-reported last-updated timestamp (distinct from when
    /// we fetched it).
    pub updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NormalizedEntry {
    /// Stable identity: the feed's native entry ID when present, otherwise
    /// a `sha256:`-namespaced hash of `(feed_url, link, title)` so synthetic
    /// IDs can never collide with a real one a feed might introduce later.
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

/// Parses raw feed bytes into canonical metadata and entries.
///
/// `feed_url` is the URL the bytes were fetched from — used both as the
/// base for resolving relative links and as part of the synthetic
/// entry-ID hash input. `fetch_time` becomes `first_seen` on every entry
/// and the fallback value in the published-date chain.
///
/// A malformed individual entry is skipped with a warning rather than
/// failing the whole feed; only a document that `feed_rs` itself cannot
/// parse returns [`NormalizeError::Parse`].
pub fn parse(
    bytes: &[u8],
    feed_url: &str,
    fetch_time: DateTime<Utc>,
) -> Result<(FeedMetadata, Vec<NormalizedEntry>), NormalizeError> {
    let feed = feed_rs::parser::parse(bytes)?;

    let base = Url::parse(feed_url).ok();
    let feed_link = feed
        .links
        .first()
        .map(|l| resolve_link(&l.href, base.as_ref()));

    let metadata = FeedMetadata {
        title: feed
            .title
            .map(|t| sanitize_text_only(&strip_control_chars(&t.content))),
        link: feed_link.or_else(|| Some(feed_url.to_owned())),
        updated: feed.updated,
    };

    let mut entries = Vec::with_capacity(feed.entries.len());
    for entry in feed.entries {
        match normalize_entry(entry, feed_url, base.as_ref(), fetch_time) {
            Ok(normalized) => entries.push(normalized),
            Err(reason) => warn!(feed_url, reason, "skipping malformed entry"),
        }
    }

    Ok((metadata, entries))
}

fn normalize_entry(
    entry: feed_rs::model::Entry,
    feed_url: &str,
    base: Option<&Url>,
    fetch_time: DateTime<Utc>,
) -> Result<NormalizedEntry, &'static str> {
    let title = entry
        .title
        .map(|t| sanitize_text_only(&strip_control_chars(&t.content)));

    let link = entry
        .links
        .first()
        .map(|l| resolve_link(&l.href, base));

    let author = entry
        .authors
        .first()
        .map(|a| strip_control_chars(&a.name).into_owned());

    let content = entry
        .content
        .as_ref()
        .and_then(|c| c.body.clone())
        .map(|b| sanitize_html(&b));

    let summary = entry.summary.map(|s| sanitize_html(&s.content));

    // Date fallback chain per the normalizer contract: published, then
    // updated, then the time the document was fetched. Never clamped to
    // "now" if a feed reports a future date — that's the origin's claim,
    // not ours to second-guess.
    let published = entry.published.or(entry.updated).unwrap_or(fetch_time);
    let updated = entry.updated;

    let entry_id = synth_entry_id(&entry.id, feed_url, link.as_deref(), title.as_deref());

    Ok(NormalizedEntry {
        entry_id,
        title,
        link,
        author,
        content,
        summary,
        published,
        updated,
        first_seen: fetch_time,
    })
}

fn resolve_link(href: &str, base: Option<&Url>) -> String {
    match base {
        Some(base) => base
            .join(href)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| href.to_owned()),
        None => href.to_owned(),
    }
}

fn synth_entry_id(
    native_id: &str,
    feed_url: &str,
    link: Option<&str>,
    title: Option<&str>,
) -> String {
    let trimmed = native_id.trim();
    if !trimmed.is_empty() {
        return trimmed.to_owned();
    }

    let input = format!(
        "{}|{}|{}",
        feed_url,
        link.unwrap_or(""),
        title.unwrap_or("")
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("sha256:{hash:x}")
}
