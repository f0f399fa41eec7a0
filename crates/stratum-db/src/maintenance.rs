//! Schema migration and destructive reset.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tracing::{info, warn};

use stratum_core::{Error, Result};

/// Current schema version recorded after a successful migrate.
pub const SCHEMA_VERSION: i32 = 2;

const SCHEMA_SQL: &str = include_str!("../schema.sql");

/// Apply the embedded schema. Idempotent; safe to run at every startup.
/// A failure here is structural: callers abort rather than continue.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(SCHEMA_SQL)
        .execute(pool)
        .await
        .map_err(|e| Error::Migration(format!("schema apply failed: {e}")))?;

    sqlx::query(
        "INSERT INTO schema_version (version) VALUES ($1)
         ON CONFLICT (version) DO NOTHING",
    )
    .bind(SCHEMA_VERSION)
    .execute(pool)
    .await
    .map_err(|e| Error::Migration(format!("version record failed: {e}")))?;

    info!(
        subsystem = "db",
        component = "maintenance",
        op = "migrate",
        version = SCHEMA_VERSION,
        "Schema migration applied"
    );
    Ok(())
}

/// True once the schema has been applied. Used by `stats` and pipeline
/// runs to fail fast with a structural error instead of a confusing
/// missing-relation message.
pub async fn schema_present(pool: &PgPool) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (
             SELECT 1 FROM information_schema.tables
             WHERE table_name = 'schema_version'
         )",
    )
    .fetch_one(pool)
    .await
    .map_err(Error::Database)?;
    Ok(exists)
}

/// Everything worth keeping from a store about to be emptied.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BackupSnapshot {
    pub taken_at: String,
    pub elements: Vec<serde_json::Value>,
    pub lineage: Vec<serde_json::Value>,
    pub jobs: Vec<serde_json::Value>,
}

impl BackupSnapshot {
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty() && self.lineage.is_empty() && self.jobs.is_empty()
    }
}

/// Write the snapshot to `dir/stratum_backup_<timestamp>.json` and return
/// the path. Split out of `reset` so the write path is unit-testable.
pub fn write_backup(dir: &Path, snapshot: &BackupSnapshot) -> Result<PathBuf> {
    let filename = format!(
        "stratum_backup_{}.json",
        Utc::now().format("%Y%m%dT%H%M%S")
    );
    let path = dir.join(filename);
    let body = serde_json::to_vec_pretty(snapshot)?;
    std::fs::write(&path, body)?;
    Ok(path)
}

/// Snapshot every table into a JSON backup, then empty the store.
///
/// The backup is written and fsync'd before any row is deleted; if the
/// write fails the store is untouched.
pub async fn reset(pool: &PgPool, backup_dir: &Path) -> Result<PathBuf> {
    let snapshot = snapshot_all(pool).await?;
    let backup_path = write_backup(backup_dir, &snapshot)?;

    warn!(
        subsystem = "db",
        component = "maintenance",
        op = "reset",
        backup = %backup_path.display(),
        elements = snapshot.elements.len(),
        jobs = snapshot.jobs.len(),
        "Backup written; emptying store"
    );

    sqlx::raw_sql(
        "TRUNCATE lineage_edge, knowledge_element, enrichment_queue, watch_state",
    )
    .execute(pool)
    .await
    .map_err(Error::Database)?;

    Ok(backup_path)
}

async fn snapshot_all(pool: &PgPool) -> Result<BackupSnapshot> {
    let elements = rows_as_json(
        pool,
        "SELECT row_to_json(e) AS j FROM knowledge_element e ORDER BY e.created_at",
    )
    .await?;
    let lineage = rows_as_json(
        pool,
        "SELECT row_to_json(l) AS j FROM lineage_edge l ORDER BY l.child_id",
    )
    .await?;
    let jobs = rows_as_json(
        pool,
        "SELECT row_to_json(q) AS j FROM enrichment_queue q ORDER BY q.created_at",
    )
    .await?;

    Ok(BackupSnapshot {
        taken_at: Utc::now().to_rfc3339(),
        elements,
        lineage,
        jobs,
    })
}

async fn rows_as_json(pool: &PgPool, query: &str) -> Result<Vec<serde_json::Value>> {
    let rows = sqlx::query(query)
        .fetch_all(pool)
        .await
        .map_err(Error::Database)?;
    Ok(rows
        .into_iter()
        .map(|row| row.get::<serde_json::Value, _>("j"))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_backup_creates_file() {
        let dir = std::env::temp_dir().join(format!("stratum-backup-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();

        let snapshot = BackupSnapshot {
            taken_at: Utc::now().to_rfc3339(),
            elements: vec![serde_json::json!({"id": "f_abc", "kind": "fact"})],
            lineage: vec![],
            jobs: vec![],
        };

        let path = write_backup(&dir, &snapshot).unwrap();
        assert!(path.exists());
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("stratum_backup_"));

        let restored: BackupSnapshot =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(restored.elements.len(), 1);
        assert_eq!(restored.elements[0]["id"], "f_abc");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_snapshot_is_empty() {
        let snapshot = BackupSnapshot::default();
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_schema_sql_contains_all_tables() {
        for table in [
            "schema_version",
            "enrichment_queue",
            "knowledge_element",
            "lineage_edge",
            "watch_state",
        ] {
            assert!(SCHEMA_SQL.contains(table), "schema missing {table}");
        }
    }
}
