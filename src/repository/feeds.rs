use chrono::Utc;

use super::schema::Database;
use super::types::{Feed, RepositoryError};

impl Database {
    pub async fn add_feed(&self, url: &str, title: Option<&str>) -> Result<Feed, RepositoryError> {
        let existing = sqlx::query_scalar::<_, i64>("SELECT id FROM feeds WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        if existing.is_some() {
            return Err(RepositoryError::Duplicate(url.to_owned()));
        }

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO feeds (url, title, active, created_at) VALUES (?, ?, 1, ?) RETURNING id",
        )
        .bind(url)
        .bind(title)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        self.get_feed_by_id(id).await?.ok_or(RepositoryError::NotFound(id))
    }

    pub async fn remove_feed(&self, id: i64) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM feeds WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_feed_by_id(&self, id: i64) -> Result<Option<Feed>, RepositoryError> {
        let feed = sqlx::query_as::<_, Feed>("SELECT * FROM feeds WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(feed)
    }

    pub async fn get_feed_by_url(&self, url: &str) -> Result<Option<Feed>, RepositoryError> {
        let feed = sqlx::query_as::<_, Feed>("SELECT * FROM feeds WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(feed)
    }

    /// Feeds the orchestrator should attempt this run. Snapshotting this
    /// list before fan-out (rather than re-querying mid-run) is what makes
    /// a feed removed during an update harmless: its writes target a row
    /// that no longer satisfies the foreign key and are silently dropped.
    pub async fn get_active_feeds(&self) -> Result<Vec<Feed>, RepositoryError> {
        let feeds = sqlx::query_as::<_, Feed>("SELECT * FROM feeds WHERE active = 1 ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(feeds)
    }

    pub async fn get_feeds(&self) -> Result<Vec<Feed>, RepositoryError> {
        let feeds = sqlx::query_as::<_, Feed>("SELECT * FROM feeds ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(feeds)
    }

    pub async fn update_feed_url(&self, id: i64, new_url: &str) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE feeds SET url = ? WHERE id = ?")
            .bind(new_url)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Refreshes the feed's self-reported title, site link, and last-updated
    /// timestamp. A field the normalizer didn't find (`None`) leaves the
    /// previously stored value in place rather than blanking it out.
    pub async fn update_feed_metadata(
        &self,
        id: i64,
        title: Option<&str>,
        link: Option<&str>,
        updated: Option<chrono::DateTime<Utc>>,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE feeds SET title = COALESCE(?, title), link = COALESCE(?, link), \
             updated = COALESCE(?, updated) WHERE id = ?",
        )
        .bind(title)
        .bind(link)
        .bind(updated)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Records a successful fetch's conditional-request validators and
    /// clears any prior error state. Called after a 200 or a 304 — a 304
    /// leaves `etag`/`last_modified` unchanged but still clears the error.
    pub async fn update_feed_cache(
        &self,
        id: i64,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE feeds SET etag = COALESCE(?, etag), last_modified = COALESCE(?, last_modified), \
             last_fetched_at = ?, fetch_error = NULL, fetch_error_count = 0 WHERE id = ?",
        )
        .bind(etag)
        .bind(last_modified)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Records a fetch failure. The error count is tracked and surfaced
    /// for display but never gates whether the feed is attempted again —
    /// a feed with a sustained error count is still retried on every run.
    pub async fn update_feed_error(&self, id: i64, error: &str) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE feeds SET last_fetched_at = ?, fetch_error = ?, \
             fetch_error_count = fetch_error_count + 1 WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
