//! Watcher state repository: last-seen checksum/mtime per source file.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};

use stratum_core::{Error, Result, WatchEntry, WatchStateRepository};

/// PostgreSQL implementation of [`WatchStateRepository`].
pub struct PgWatchStateRepository {
    pool: PgPool,
}

impl PgWatchStateRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn parse_entry_row(row: sqlx::postgres::PgRow) -> WatchEntry {
        WatchEntry {
            path: row.get("path"),
            checksum: row.get("checksum"),
            mtime: row.get("mtime"),
            processed_at: row.get("processed_at"),
        }
    }
}

#[async_trait]
impl WatchStateRepository for PgWatchStateRepository {
    async fn get(&self, path: &str) -> Result<Option<WatchEntry>> {
        let row = sqlx::query(
            "SELECT path, checksum, mtime, processed_at FROM watch_state WHERE path = $1",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(row.map(Self::parse_entry_row))
    }

    async fn upsert(&self, entry: &WatchEntry) -> Result<()> {
        // A content change resets processed_at: the file needs extraction
        // again.
        sqlx::query(
            "INSERT INTO watch_state (path, checksum, mtime, processed_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (path) DO UPDATE
                 SET checksum = EXCLUDED.checksum,
                     mtime = EXCLUDED.mtime,
                     processed_at = CASE
                         WHEN watch_state.checksum <> EXCLUDED.checksum THEN NULL
                         ELSE watch_state.processed_at
                     END",
        )
        .bind(&entry.path)
        .bind(&entry.checksum)
        .bind(entry.mtime)
        .bind(entry.processed_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn mark_processed(&self, path: &str) -> Result<()> {
        sqlx::query("UPDATE watch_state SET processed_at = $1 WHERE path = $2")
            .bind(Utc::now())
            .bind(path)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn list_unprocessed(&self) -> Result<Vec<WatchEntry>> {
        let rows = sqlx::query(
            "SELECT path, checksum, mtime, processed_at FROM watch_state
             WHERE processed_at IS NULL
             ORDER BY mtime ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(rows.into_iter().map(Self::parse_entry_row).collect())
    }
}
