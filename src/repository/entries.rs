use chrono::{DateTime, Duration, Utc};

use super::schema::Database;
use super::types::{Entry, NewEntry, RepositoryError, SortBy};

/// When a time-windowed query returns nothing, how many of the most recent
/// entries (ignoring the window) to return instead.
const SMART_FALLBACK_LIMIT: i64 = 50;

impl Database {
    /// Inserts a new entry or updates an existing one, identified by
    /// `(feed_id, entry_id)`. `first_seen` is set only on first insert and
    /// is never overwritten on update — it is the monotonic record of when
    /// this repository first observed the entry, independent of whatever
    /// `published`/`updated` timestamps a feed reports on a later fetch.
    pub async fn upsert_entry(&self, feed_id: i64, entry: &NewEntry) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT OR IGNORE INTO entries \
             (feed_id, entry_id, title, link, author, content, summary, published, updated, first_seen) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(feed_id)
        .bind(&entry.entry_id)
        .bind(&entry.title)
        .bind(&entry.link)
        .bind(&entry.author)
        .bind(&entry.content)
        .bind(&entry.summary)
        .bind(entry.published)
        .bind(entry.updated)
        .bind(entry.first_seen)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE entries SET title = ?, link = ?, author = ?, content = ?, summary = ?, \
             published = ?, updated = ? WHERE feed_id = ? AND entry_id = ?",
        )
        .bind(&entry.title)
        .bind(&entry.link)
        .bind(&entry.author)
        .bind(&entry.content)
        .bind(&entry.summary)
        .bind(entry.published)
        .bind(entry.updated)
        .bind(feed_id)
        .bind(&entry.entry_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Total entry count across every feed, ignoring any time window.
    pub async fn count_entries(&self) -> Result<i64, RepositoryError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn count_entries_for_feed(&self, feed_id: i64) -> Result<i64, RepositoryError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entries WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn count_recent_entries(
        &self,
        days: i64,
        filter_by_first_seen: bool,
    ) -> Result<i64, RepositoryError> {
        let cutoff = Utc::now() - Duration::days(days);
        let column = if filter_by_first_seen { "first_seen" } else { "published" };
        let sql = format!("SELECT COUNT(*) FROM entries WHERE {column} >= ?");
        let count: i64 = sqlx::query_scalar(&sql).bind(cutoff).fetch_one(&self.pool).await?;
        Ok(count)
    }

    /// Returns entries published (or first-seen, per `filter_by_first_seen`)
    /// within the last `days` days, sorted by `sort_by` descending.
    ///
    /// If the window yields no rows at all, falls back to the
    /// [`SMART_FALLBACK_LIMIT`] most recent entries ignoring the window —
    /// an aggregator with only month-old feeds shouldn't render an empty
    /// page just because the default window is a week.
    pub async fn get_recent_entries(
        &self,
        days: i64,
        filter_by_first_seen: bool,
        sort_by: SortBy,
    ) -> Result<Vec<Entry>, RepositoryError> {
        let window_column = if filter_by_first_seen { "first_seen" } else { "published" };
        let sort_column = sort_by.column();
        let cutoff = Utc::now() - Duration::days(days);

        let sql = format!(
            "SELECT * FROM entries WHERE {window_column} >= ? ORDER BY {sort_column} DESC"
        );
        let windowed = sqlx::query_as::<_, Entry>(&sql)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;

        if !windowed.is_empty() {
            return Ok(windowed);
        }

        let fallback_sql = format!("SELECT * FROM entries ORDER BY {sort_column} DESC LIMIT ?");
        let fallback = sqlx::query_as::<_, Entry>(&fallback_sql)
            .bind(SMART_FALLBACK_LIMIT)
            .fetch_all(&self.pool)
            .await?;
        Ok(fallback)
    }

    pub async fn prune_old_entries(&self, older_than: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM entries WHERE first_seen < ?")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
