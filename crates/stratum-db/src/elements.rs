//! Knowledge element and lineage edge repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use stratum_core::{
    ElementCounts, ElementKind, ElementRepository, Error, KnowledgeElement, LineageEdge, Result,
    UpsertOutcome,
};

/// PostgreSQL implementation of [`ElementRepository`].
///
/// Elements are keyed by derivation identity: the `derivation_key` UNIQUE
/// constraint plus `ON CONFLICT DO UPDATE` is what makes layer re-runs
/// idempotent at the storage level.
pub struct PgElementRepository {
    pool: PgPool,
}

impl PgElementRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn parse_element_row(row: sqlx::postgres::PgRow) -> KnowledgeElement {
        let kind: String = row.get("kind");
        KnowledgeElement {
            id: row.get("id"),
            kind: ElementKind::from_str_lossy(&kind),
            content: row.get("content"),
            confidence: row.get("confidence"),
            source_count: row.get("source_count"),
            derivation_key: row.get("derivation_key"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            superseded: row.get("superseded"),
        }
    }
}

const ELEMENT_COLUMNS: &str = "id, kind, content, confidence, source_count, derivation_key, \
                               created_at, updated_at, superseded";

#[async_trait]
impl ElementRepository for PgElementRepository {
    async fn upsert(
        &self,
        element: KnowledgeElement,
        parents: &[LineageEdge],
    ) -> Result<UpsertOutcome> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let now = Utc::now();

        // xmax = 0 only on a freshly inserted row, so it distinguishes
        // insert from conflict-update in one round trip.
        let row = sqlx::query(
            "INSERT INTO knowledge_element
                 (id, kind, content, confidence, source_count, derivation_key,
                  created_at, updated_at, superseded)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $7, FALSE)
             ON CONFLICT (derivation_key) DO UPDATE
                 SET content = EXCLUDED.content,
                     confidence = EXCLUDED.confidence,
                     source_count = EXCLUDED.source_count,
                     updated_at = EXCLUDED.updated_at,
                     superseded = FALSE
             RETURNING id, (xmax = 0) AS inserted",
        )
        .bind(&element.id)
        .bind(element.kind.as_str())
        .bind(&element.content)
        .bind(element.confidence)
        .bind(element.source_count)
        .bind(&element.derivation_key)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let id: String = row.get("id");
        let inserted: bool = row.get("inserted");

        for edge in parents {
            sqlx::query(
                "INSERT INTO lineage_edge (child_id, parent_ref, metadata)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (child_id, parent_ref) DO UPDATE
                     SET metadata = EXCLUDED.metadata",
            )
            .bind(&id)
            .bind(&edge.parent_ref)
            .bind(&edge.metadata)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        tx.commit().await.map_err(Error::Database)?;

        if inserted {
            Ok(UpsertOutcome::Inserted(id))
        } else {
            Ok(UpsertOutcome::Unchanged(id))
        }
    }

    async fn get(&self, id: &str) -> Result<Option<KnowledgeElement>> {
        let query = format!("SELECT {ELEMENT_COLUMNS} FROM knowledge_element WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(row.map(Self::parse_element_row))
    }

    async fn list_kind(&self, kind: ElementKind) -> Result<Vec<KnowledgeElement>> {
        let query = format!(
            "SELECT {ELEMENT_COLUMNS} FROM knowledge_element
             WHERE kind = $1 AND NOT superseded
             ORDER BY created_at ASC"
        );
        let rows = sqlx::query(&query)
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(rows.into_iter().map(Self::parse_element_row).collect())
    }

    async fn list_kind_since(
        &self,
        kind: ElementKind,
        since: DateTime<Utc>,
    ) -> Result<Vec<KnowledgeElement>> {
        let query = format!(
            "SELECT {ELEMENT_COLUMNS} FROM knowledge_element
             WHERE kind = $1 AND NOT superseded AND created_at > $2
             ORDER BY created_at ASC"
        );
        let rows = sqlx::query(&query)
            .bind(kind.as_str())
            .bind(since)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(rows.into_iter().map(Self::parse_element_row).collect())
    }

    async fn facts_without_theme(&self) -> Result<Vec<KnowledgeElement>> {
        let query = format!(
            "SELECT {ELEMENT_COLUMNS} FROM knowledge_element e
             WHERE e.kind = 'fact' AND NOT e.superseded
               AND NOT EXISTS (
                   SELECT 1 FROM lineage_edge le
                   JOIN knowledge_element t ON t.id = le.child_id AND t.kind = 'theme'
                   WHERE le.parent_ref = e.id
               )
             ORDER BY e.created_at ASC"
        );
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(rows.into_iter().map(Self::parse_element_row).collect())
    }

    async fn parents_of(&self, id: &str) -> Result<Vec<LineageEdge>> {
        let rows = sqlx::query(
            "SELECT child_id, parent_ref, metadata FROM lineage_edge
             WHERE child_id = $1
             ORDER BY parent_ref",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| LineageEdge {
                child_id: row.get("child_id"),
                parent_ref: row.get("parent_ref"),
                metadata: row.get("metadata"),
            })
            .collect())
    }

    async fn children_of(&self, parent_ref: &str) -> Result<Vec<LineageEdge>> {
        let rows = sqlx::query(
            "SELECT child_id, parent_ref, metadata FROM lineage_edge
             WHERE parent_ref = $1
             ORDER BY child_id",
        )
        .bind(parent_ref)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| LineageEdge {
                child_id: row.get("child_id"),
                parent_ref: row.get("parent_ref"),
                metadata: row.get("metadata"),
            })
            .collect())
    }

    async fn has_elements_for_root(&self, root_ref: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM lineage_edge WHERE parent_ref = $1)",
        )
        .bind(root_ref)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(exists)
    }

    async fn supersede_documents(&self, except_id: &str, profile: &str) -> Result<i64> {
        let result = sqlx::query(
            "UPDATE knowledge_element
             SET superseded = TRUE, updated_at = $1
             WHERE kind = 'document' AND NOT superseded
               AND id <> $2 AND content->>'profile' = $3",
        )
        .bind(Utc::now())
        .bind(except_id)
        .bind(profile)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() as i64)
    }

    async fn counts(&self) -> Result<ElementCounts> {
        let row = sqlx::query(
            "SELECT
                COUNT(*) FILTER (WHERE kind = 'fact') as facts,
                COUNT(*) FILTER (WHERE kind = 'theme') as themes,
                COUNT(*) FILTER (WHERE kind = 'insight') as insights,
                COUNT(*) FILTER (WHERE kind = 'document') as documents
             FROM knowledge_element
             WHERE NOT superseded",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(ElementCounts {
            facts: row.get::<i64, _>("facts"),
            themes: row.get::<i64, _>("themes"),
            insights: row.get::<i64, _>("insights"),
            documents: row.get::<i64, _>("documents"),
        })
    }
}
