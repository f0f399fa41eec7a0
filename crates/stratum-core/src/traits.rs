//! Core traits for stratum abstractions.
//!
//! These traits define the interfaces that concrete implementations must
//! satisfy, enabling pluggable backends and testability. The durable
//! store implementations live in stratum-db; the reasoning backend in
//! stratum-inference; source connectors are external collaborators that
//! appear here as interfaces only.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// ENRICHMENT QUEUE
// =============================================================================

/// Repository for the durable enrichment job queue.
///
/// The store is the sole synchronization point between workers: `dequeue`
/// must claim atomically, so the design stays safe even if workers run as
/// separate processes.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a pending job unless one already exists for that
    /// `(session_id, source)`. Returns `None` when deduplicated.
    async fn enqueue(
        &self,
        session_id: &str,
        source: JobSource,
        priority: i32,
    ) -> Result<Option<Uuid>>;

    /// Atomically claim up to `n` pending jobs ordered by
    /// `(priority ASC, created_at ASC)` and mark them processing.
    async fn dequeue(&self, n: i64) -> Result<Vec<EnrichmentJob>>;

    /// Mark a job completed.
    async fn complete(&self, job_id: Uuid) -> Result<()>;

    /// Mark a job completed with a skip annotation. The annotation is
    /// durable, so orphan detection never mistakes a skipped session
    /// for a lost enrichment and re-queues it.
    async fn complete_skipped(&self, job_id: Uuid, reason: &str) -> Result<()>;

    /// Record the error, increment attempts, leave the job failed.
    /// The caller decides whether to requeue.
    async fn fail(&self, job_id: Uuid, error: &str) -> Result<()>;

    /// Move a failed job back to pending, clearing the error.
    async fn requeue(&self, job_id: Uuid) -> Result<()>;

    /// Reset jobs stuck in `processing` beyond the staleness threshold
    /// back to pending, clearing attempts and timestamps. Returns the
    /// number of jobs reset.
    async fn reset_stuck(&self, staleness: Duration) -> Result<i64>;

    /// Delete terminal jobs older than the retention window (days).
    /// Returns the number of jobs deleted.
    async fn clear_old(&self, days: i64) -> Result<i64>;

    /// Get a job by ID.
    async fn get(&self, job_id: Uuid) -> Result<Option<EnrichmentJob>>;

    /// All jobs for one connector, newest first.
    async fn list_for_source(&self, source: JobSource) -> Result<Vec<EnrichmentJob>>;

    /// Pending job count, for health reporting.
    async fn pending_count(&self) -> Result<i64>;

    /// Aggregate queue statistics.
    async fn stats(&self) -> Result<QueueStats>;

    /// Completed jobs whose expected fact output never materialized.
    /// Detected during backlog rescans and requeued (self-healing; the
    /// upstream cause of completion-without-output is a known defect).
    async fn orphaned_completed(&self) -> Result<Vec<EnrichmentJob>>;
}

// =============================================================================
// KNOWLEDGE ELEMENTS
// =============================================================================

/// Outcome of an element upsert, keyed by derivation identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new element row was created.
    Inserted(String),
    /// An element with the same derivation key already existed; content
    /// refreshed, no new row.
    Unchanged(String),
}

impl UpsertOutcome {
    pub fn id(&self) -> &str {
        match self {
            UpsertOutcome::Inserted(id) | UpsertOutcome::Unchanged(id) => id,
        }
    }

    pub fn is_inserted(&self) -> bool {
        matches!(self, UpsertOutcome::Inserted(_))
    }
}

/// Repository for knowledge elements and their lineage edges.
#[async_trait]
pub trait ElementRepository: Send + Sync {
    /// Upsert an element by its derivation key and record its lineage
    /// edges. Must not duplicate an element whose upstream lineage is
    /// unchanged.
    async fn upsert(
        &self,
        element: KnowledgeElement,
        parents: &[LineageEdge],
    ) -> Result<UpsertOutcome>;

    /// Get an element by prefixed ID.
    async fn get(&self, id: &str) -> Result<Option<KnowledgeElement>>;

    /// All non-superseded elements of one kind.
    async fn list_kind(&self, kind: ElementKind) -> Result<Vec<KnowledgeElement>>;

    /// Elements of one kind created after a timestamp.
    async fn list_kind_since(
        &self,
        kind: ElementKind,
        since: DateTime<Utc>,
    ) -> Result<Vec<KnowledgeElement>>;

    /// Facts not yet referenced as a parent by any theme.
    async fn facts_without_theme(&self) -> Result<Vec<KnowledgeElement>>;

    /// Direct lineage edges into `id` (what it was derived from).
    async fn parents_of(&self, id: &str) -> Result<Vec<LineageEdge>>;

    /// Direct lineage edges out of `parent_ref` (what was derived from it).
    async fn children_of(&self, parent_ref: &str) -> Result<Vec<LineageEdge>>;

    /// True if any element claims `root_ref` as a lineage parent. Used to
    /// decide whether a raw unit still needs L1.
    async fn has_elements_for_root(&self, root_ref: &str) -> Result<bool>;

    /// Mark the previous generation of a document profile superseded.
    async fn supersede_documents(&self, except_id: &str, profile: &str) -> Result<i64>;

    /// Element counts by kind, for `stats`.
    async fn counts(&self) -> Result<ElementCounts>;
}

// =============================================================================
// WATCHER STATE
// =============================================================================

/// Durable last-seen checksum/mtime per watched source file.
#[async_trait]
pub trait WatchStateRepository: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<WatchEntry>>;

    /// Insert or update the last-seen checksum/mtime for a path.
    async fn upsert(&self, entry: &WatchEntry) -> Result<()>;

    /// Record that the transcript's facts were extracted.
    async fn mark_processed(&self, path: &str) -> Result<()>;

    /// Every watched file never marked processed, for the startup backlog
    /// scan.
    async fn list_unprocessed(&self) -> Result<Vec<WatchEntry>>;
}

// =============================================================================
// REASONING SERVICE (external collaborator)
// =============================================================================

/// A fact extracted from one raw unit.
#[derive(Debug, Clone)]
pub struct ExtractedFact {
    pub content: JsonValue,
    pub confidence: f64,
}

/// A cluster of facts proposed by the reasoning service.
#[derive(Debug, Clone)]
pub struct ThemeCluster {
    pub label: String,
    pub summary: String,
    /// Element IDs of the constituent facts. Must be non-empty.
    pub fact_ids: Vec<String>,
    pub confidence: f64,
}

/// A cross-theme insight proposed by the reasoning service.
#[derive(Debug, Clone)]
pub struct InsightDraft {
    pub content: JsonValue,
    /// Theme IDs cited as evidence. Must be non-empty (directly or via
    /// facts).
    pub theme_ids: Vec<String>,
    /// Facts cited directly, in addition to themes.
    pub fact_ids: Vec<String>,
    /// Cross-source disagreement, preserved as structured metadata rather
    /// than silently resolved.
    pub disagreement: Option<JsonValue>,
    pub confidence: f64,
    pub source_count: i32,
}

/// The external reasoning service that turns text into structured
/// facts/themes/insights. Slow, rate-limited, and fallible; consumed as a
/// call returning structured output or failing.
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    /// Extract atomic facts from one raw unit's text.
    async fn extract_facts(&self, unit_ref: &str, text: &str) -> Result<Vec<ExtractedFact>>;

    /// Cluster facts into themes.
    async fn cluster_themes(&self, facts: &[KnowledgeElement]) -> Result<Vec<ThemeCluster>>;

    /// Synthesize insights across themes (and optionally facts directly).
    async fn synthesize_insights(
        &self,
        themes: &[KnowledgeElement],
        facts: &[KnowledgeElement],
    ) -> Result<Vec<InsightDraft>>;

    /// Render a narrative document for a profile ("person", "organization",
    /// "project_tracker") from the current insight set.
    async fn render_document(
        &self,
        profile: &str,
        insights: &[KnowledgeElement],
    ) -> Result<String>;

    /// Model identifier, for logs and provenance.
    fn model_name(&self) -> &str;

    /// Check that the backend is reachable and responding.
    async fn health_check(&self) -> Result<bool>;
}

// =============================================================================
// SOURCE CONNECTORS (external collaborators)
// =============================================================================

/// Produces raw sessions. Chat-history sync lives outside this system;
/// the pipeline only consumes this interface.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Fetch one session's raw content. `None` when the connector no
    /// longer has it.
    async fn fetch(&self, session_id: &str, source: JobSource) -> Result<Option<RawSession>>;

    /// Sessions matching the filters, for backlog scans and L1 runs.
    async fn list(
        &self,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
        source: Option<JobSource>,
    ) -> Result<Vec<RawSession>>;
}

// =============================================================================
// ENRICHMENT COLLABORATOR (worker-facing)
// =============================================================================

/// Outcome of enriching one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrichOutcome {
    /// Facts were extracted and persisted.
    Enriched { facts: usize },
    /// Non-retryable skip (empty content, already enriched). Recorded
    /// distinctly from failure so the job is not retried forever.
    Skipped { reason: String },
}

/// Per-session fact extraction, invoked by the worker pool for one exact
/// `(session_id, source)` so two workers never race on the same logical
/// unit.
#[async_trait]
pub trait SessionEnricher: Send + Sync {
    async fn enrich(&self, session_id: &str, source: JobSource) -> Result<EnrichOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_outcome_accessors() {
        let inserted = UpsertOutcome::Inserted("f_new".to_string());
        let unchanged = UpsertOutcome::Unchanged("f_old".to_string());
        assert_eq!(inserted.id(), "f_new");
        assert_eq!(unchanged.id(), "f_old");
        assert!(inserted.is_inserted());
        assert!(!unchanged.is_inserted());
    }

    #[test]
    fn test_enrich_outcome_equality() {
        assert_eq!(
            EnrichOutcome::Skipped {
                reason: "empty content".to_string()
            },
            EnrichOutcome::Skipped {
                reason: "empty content".to_string()
            }
        );
        assert_ne!(
            EnrichOutcome::Enriched { facts: 1 },
            EnrichOutcome::Enriched { facts: 2 }
        );
    }
}
