use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use super::types::RepositoryError;

#[cfg(unix)]
fn pre_create_with_restrictive_perms(path: &Path) -> std::io::Result<()> {
    use std::fs::OpenOptions;
    use std::os::unix::fs::OpenOptionsExt;

    if path.exists() {
        return Ok(());
    }
    OpenOptions::new()
        .write(true)
        .create(true)
        .mode(0o600)
        .open(path)?;
    Ok(())
}

#[cfg(not(unix))]
fn pre_create_with_restrictive_perms(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// The durable store of feeds and entries, backed by a single SQLite file.
#[derive(Clone)]
pub struct Database {
    pub(super) pool: SqlitePool,
}

impl Database {
    /// Opens (creating if necessary) the database at `path`, applies
    /// migrations, and returns a ready-to-use pool. The file is created
    /// with owner-only permissions before SQLite ever touches it so a
    /// world-readable default umask can't leak feed data.
    pub async fn open(path: &Path) -> Result<Self, RepositoryError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| RepositoryError::Migration(e.to_string()))?;
            }
        }
        pre_create_with_restrictive_perms(path)
            .map_err(|e| RepositoryError::Migration(e.to_string()))?;

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(std::time::Duration::from_secs(10))
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// In-memory database for tests: same schema, no filesystem footprint.
    pub async fn open_in_memory() -> Result<Self, RepositoryError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL UNIQUE,
                title TEXT,
                link TEXT,
                updated TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                etag TEXT,
                last_modified TEXT,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                last_fetched_at TEXT,
                fetch_error TEXT,
                fetch_error_count INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                entry_id TEXT NOT NULL,
                title TEXT,
                link TEXT,
                author TEXT,
                content TEXT,
                summary TEXT,
                published TEXT NOT NULL,
                updated TEXT,
                first_seen TEXT NOT NULL,
                UNIQUE(feed_id, entry_id)
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_feed_id ON entries(feed_id)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_published ON entries(published)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_first_seen ON entries(first_seen)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_feeds_active ON feeds(active)")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!("database schema is up to date");
        Ok(())
    }
}
