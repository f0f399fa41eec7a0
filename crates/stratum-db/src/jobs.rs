//! Enrichment job queue repository.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use stratum_core::{
    EnrichmentJob, Error, JobRepository, JobSource, JobStatus, QueueStats, Result,
};

/// PostgreSQL implementation of [`JobRepository`].
///
/// The queue table is the sole synchronization point between workers:
/// `dequeue` claims with `FOR UPDATE SKIP LOCKED`, so concurrent workers
/// (even in separate processes) never claim the same job.
pub struct PgJobRepository {
    pool: PgPool,
}

impl PgJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn parse_job_row(row: sqlx::postgres::PgRow) -> EnrichmentJob {
        let source: String = row.get("source");
        let status: String = row.get("status");
        EnrichmentJob {
            id: row.get("id"),
            session_id: row.get("session_id"),
            source: JobSource::from_str_lossy(&source),
            priority: row.get("priority"),
            status: JobStatus::from_str_lossy(&status),
            attempts: row.get("attempts"),
            error: row.get("error"),
            skip_reason: row.get("skip_reason"),
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
        }
    }
}

const JOB_COLUMNS: &str =
    "id, session_id, source, priority, status, attempts, error, skip_reason, created_at, started_at, completed_at";

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn enqueue(
        &self,
        session_id: &str,
        source: JobSource,
        priority: i32,
    ) -> Result<Option<Uuid>> {
        let job_id = Uuid::now_v7();
        let now = Utc::now();

        // Atomic check-and-insert: one row per (session_id, source)
        // regardless of status, so concurrent enqueues of the same logical
        // unit cannot race past each other. The UNIQUE constraint backs
        // this up.
        let result = sqlx::query_scalar::<_, Uuid>(
            "INSERT INTO enrichment_queue (id, session_id, source, priority, status, created_at)
             SELECT $1, $2, $3, $4, 'pending', $5
             WHERE NOT EXISTS (
                 SELECT 1 FROM enrichment_queue
                 WHERE session_id = $2 AND source = $3
             )
             RETURNING id",
        )
        .bind(job_id)
        .bind(session_id)
        .bind(source.as_str())
        .bind(priority)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result)
    }

    async fn dequeue(&self, n: i64) -> Result<Vec<EnrichmentJob>> {
        let now = Utc::now();

        let query = format!(
            "UPDATE enrichment_queue
             SET status = 'processing', started_at = $1
             WHERE id IN (
                 SELECT id FROM enrichment_queue
                 WHERE status = 'pending'
                 ORDER BY priority ASC, created_at ASC
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {JOB_COLUMNS}"
        );

        let rows = sqlx::query(&query)
            .bind(now)
            .bind(n)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        let mut jobs: Vec<EnrichmentJob> = rows.into_iter().map(Self::parse_job_row).collect();
        // RETURNING order is unspecified; restore the claim order.
        jobs.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(jobs)
    }

    async fn complete(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE enrichment_queue
             SET status = 'completed', completed_at = $1
             WHERE id = $2",
        )
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn complete_skipped(&self, job_id: Uuid, reason: &str) -> Result<()> {
        sqlx::query(
            "UPDATE enrichment_queue
             SET status = 'completed', completed_at = $1, skip_reason = $2
             WHERE id = $3",
        )
        .bind(Utc::now())
        .bind(reason)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE enrichment_queue
             SET status = 'failed', attempts = attempts + 1, error = $1, completed_at = $2
             WHERE id = $3",
        )
        .bind(error)
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn requeue(&self, job_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            "UPDATE enrichment_queue
             SET status = 'pending', error = NULL, started_at = NULL, completed_at = NULL
             WHERE id = $1 AND status IN ('failed', 'completed')",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::Job(format!(
                "job {job_id} is not in a requeueable state"
            )));
        }
        Ok(())
    }

    async fn reset_stuck(&self, staleness: Duration) -> Result<i64> {
        let cutoff = Utc::now() - staleness;

        let result = sqlx::query(
            "UPDATE enrichment_queue
             SET status = 'pending', attempts = 0, error = NULL,
                 started_at = NULL, completed_at = NULL
             WHERE status = 'processing' AND started_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() as i64)
    }

    async fn clear_old(&self, days: i64) -> Result<i64> {
        let cutoff = Utc::now() - Duration::days(days);

        let result = sqlx::query(
            "DELETE FROM enrichment_queue
             WHERE status IN ('completed', 'failed') AND completed_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() as i64)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<EnrichmentJob>> {
        let query = format!("SELECT {JOB_COLUMNS} FROM enrichment_queue WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(row.map(Self::parse_job_row))
    }

    async fn list_for_source(&self, source: JobSource) -> Result<Vec<EnrichmentJob>> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM enrichment_queue
             WHERE source = $1
             ORDER BY created_at DESC"
        );
        let rows = sqlx::query(&query)
            .bind(source.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(rows.into_iter().map(Self::parse_job_row).collect())
    }

    async fn pending_count(&self) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM enrichment_queue WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(Error::Database)?;
        Ok(count)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            "SELECT
                COUNT(*) FILTER (WHERE status = 'pending') as pending,
                COUNT(*) FILTER (WHERE status = 'processing') as processing,
                COUNT(*) FILTER (WHERE status = 'completed') as completed,
                COUNT(*) FILTER (WHERE status = 'failed') as failed,
                COUNT(*) as total
             FROM enrichment_queue",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(QueueStats {
            pending: row.get::<i64, _>("pending"),
            processing: row.get::<i64, _>("processing"),
            completed: row.get::<i64, _>("completed"),
            failed: row.get::<i64, _>("failed"),
            total: row.get::<i64, _>("total"),
        })
    }

    async fn orphaned_completed(&self) -> Result<Vec<EnrichmentJob>> {
        // A completed job whose session never produced a lineage root is
        // an orphan: completion was recorded but the expected facts are
        // absent. Requeued by the startup sweep. Skipped jobs produce no
        // facts by definition and are excluded via their annotation.
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM enrichment_queue q
             WHERE q.status = 'completed'
               AND q.skip_reason IS NULL
               AND NOT EXISTS (
                   SELECT 1 FROM lineage_edge le
                   WHERE le.parent_ref = 's_' || q.source || '_' || q.session_id
               )"
        );
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(rows.into_iter().map(Self::parse_job_row).collect())
    }
}
