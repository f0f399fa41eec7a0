//! Core data models for stratum.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

// =============================================================================
// JOB MODEL
// =============================================================================

/// Lifecycle status shared by enrichment and synthesis jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Stable string form used in the database and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Parse the database string form. Unknown strings fall back to Pending.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "pending" => JobStatus::Pending,
            "processing" => JobStatus::Processing,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Pending,
        }
    }

    /// Terminal statuses are eligible for retention cleanup.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Origin system that produced a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSource {
    /// Chat history sync connector.
    ChatSync,
    /// File-system transcript watcher.
    TranscriptWatch,
    /// One-shot backlog catch-up scan.
    Backfill,
    /// Operator-triggered.
    Manual,
}

impl JobSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobSource::ChatSync => "chat_sync",
            JobSource::TranscriptWatch => "transcript_watch",
            JobSource::Backfill => "backfill",
            JobSource::Manual => "manual",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "chat_sync" => JobSource::ChatSync,
            "transcript_watch" => JobSource::TranscriptWatch,
            "backfill" => JobSource::Backfill,
            "manual" => JobSource::Manual,
            _ => JobSource::Manual,
        }
    }
}

/// One durable enrichment unit: extract facts from one session.
///
/// Exactly one row exists per `(session_id, source)`. Transitions
/// pending → processing → {completed | failed}; failed jobs may be
/// requeued (attempts incremented) or left terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentJob {
    pub id: Uuid,
    pub session_id: String,
    pub source: JobSource,
    /// Lower = more urgent.
    pub priority: i32,
    pub status: JobStatus,
    pub attempts: i32,
    pub error: Option<String>,
    /// Why the session was skipped rather than enriched. A skip is
    /// terminal success; the annotation keeps the job out of the
    /// orphan-requeue sweep.
    pub skip_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Queue statistics summary for health reporting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub total: i64,
}

// =============================================================================
// SYNTHESIS JOBS (in-memory, disposable)
// =============================================================================

/// Kind of synthesis work. Dispatch over this enum is exhaustive — adding
/// a variant forces every handler site to be updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisJobType {
    /// Extract facts from a single raw transcript file.
    TranscriptFacts,
    /// Run L2–L4 over the full current fact set.
    FullSynthesis,
    /// Refresh the project tracker dossier after a full synthesis.
    ProjectTracker,
    /// Re-render outputs after a prompt/template change.
    RegenerateOutputs,
}

impl SynthesisJobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SynthesisJobType::TranscriptFacts => "transcript_facts",
            SynthesisJobType::FullSynthesis => "full_synthesis",
            SynthesisJobType::ProjectTracker => "project_tracker",
            SynthesisJobType::RegenerateOutputs => "regenerate_outputs",
        }
    }
}

/// One synthesis unit, held in the in-memory serial queue.
///
/// Synthesis output is re-derivable from persisted facts, so these jobs
/// are disposable: a restart loses them and the next backlog scan or
/// debounce cycle re-creates the work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisJob {
    /// `"{type}_{uuid}"` — a v7 UUID keeps ids time-ordered and unique
    /// even when jobs of one type are created in the same instant.
    pub id: String,
    pub job_type: SynthesisJobType,
    pub payload: Option<JsonValue>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

impl SynthesisJob {
    pub fn new(job_type: SynthesisJobType, payload: Option<JsonValue>) -> Self {
        Self {
            id: format!("{}_{}", job_type.as_str(), Uuid::now_v7().simple()),
            job_type,
            payload,
            status: JobStatus::Pending,
            created_at: Utc::now(),
        }
    }
}

// =============================================================================
// KNOWLEDGE ELEMENTS
// =============================================================================

/// The four element kinds of the distillation chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Fact,
    Theme,
    Insight,
    Document,
}

impl ElementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Fact => "fact",
            ElementKind::Theme => "theme",
            ElementKind::Insight => "insight",
            ElementKind::Document => "document",
        }
    }

    /// Globally-unique ID prefix for this kind.
    pub fn prefix(&self) -> &'static str {
        match self {
            ElementKind::Fact => "f_",
            ElementKind::Theme => "t_",
            ElementKind::Insight => "i_",
            ElementKind::Document => "d_",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "fact" => ElementKind::Fact,
            "theme" => ElementKind::Theme,
            "insight" => ElementKind::Insight,
            "document" => ElementKind::Document,
            _ => ElementKind::Fact,
        }
    }

    /// Infer the kind from a prefixed element ID, if the prefix is known.
    pub fn from_id(id: &str) -> Option<Self> {
        match id.get(..2) {
            Some("f_") => Some(ElementKind::Fact),
            Some("t_") => Some(ElementKind::Theme),
            Some("i_") => Some(ElementKind::Insight),
            Some("d_") => Some(ElementKind::Document),
            _ => None,
        }
    }
}

/// The unit produced by the layer pipeline.
///
/// The `derivation_key` is a stable hash over (kind, sorted upstream refs,
/// semantic discriminator); re-running a layer over unchanged upstream
/// lineage recomputes the same key and upserts instead of duplicating.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeElement {
    /// Prefixed ID: `f_*`, `t_*`, `i_*`, `d_*`.
    pub id: String,
    pub kind: ElementKind,
    pub content: JsonValue,
    pub confidence: f64,
    /// Distinct raw sources contributing to this element.
    pub source_count: i32,
    pub derivation_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Documents only: true once a newer generation replaced this one.
    pub superseded: bool,
}

/// One derivation edge: `child_id` was computed from `parent_ref`.
///
/// `parent_ref` is either a prefixed element ID or a raw-unit reference
/// (`s_*` session, `x_*` transcript). Raw units are the roots of the
/// lineage DAG; documents are its sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageEdge {
    pub child_id: String,
    pub parent_ref: String,
    /// Structured cross-source metadata, e.g. preserved disagreement.
    pub metadata: Option<JsonValue>,
}

/// Element counts by kind, for `stats` output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ElementCounts {
    pub facts: i64,
    pub themes: i64,
    pub insights: i64,
    pub documents: i64,
}

impl ElementCounts {
    pub fn total(&self) -> i64 {
        self.facts + self.themes + self.insights + self.documents
    }
}

// =============================================================================
// WORKER STATUS
// =============================================================================

/// What a worker is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Backoff or rate-limit sleep.
    Sleeping,
    /// Polled, queue was empty.
    Idle,
    /// Executing a claimed job.
    Processing,
}

/// Ephemeral per-worker snapshot, rewritten every polling cycle.
/// Observability only; carries no coordination state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: usize,
    pub state: WorkerState,
    pub current_job_id: Option<Uuid>,
    pub current_session_id: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
}

impl WorkerStatus {
    pub fn idle(worker_id: usize) -> Self {
        Self {
            worker_id,
            state: WorkerState::Idle,
            current_job_id: None,
            current_session_id: None,
            last_heartbeat: Utc::now(),
        }
    }
}

// =============================================================================
// PIPELINE RUN CONTROL
// =============================================================================

/// A named pipeline layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Facts,
    Themes,
    Insights,
    Dossier,
}

impl Layer {
    /// Accepts both numeric (`1`–`4`) and named forms.
    pub fn parse(s: &str) -> Option<Layer> {
        match s {
            "1" | "facts" => Some(Layer::Facts),
            "2" | "themes" => Some(Layer::Themes),
            "3" | "insights" => Some(Layer::Insights),
            "4" | "dossier" => Some(Layer::Dossier),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Facts => "facts",
            Layer::Themes => "themes",
            Layer::Insights => "insights",
            Layer::Dossier => "dossier",
        }
    }
}

/// Filters and flags accepted by every pipeline run mode.
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Re-process raw units even when already covered by facts.
    pub force_reprocess: bool,
    /// Stop after L1.
    pub facts_only: bool,
    /// Log what would happen without persisting anything.
    pub dry_run: bool,
    /// Only material newer than this timestamp.
    pub since: Option<DateTime<Utc>>,
    /// Cap on units processed.
    pub limit: Option<usize>,
    /// Restrict to one connector. Only raw units carry a connector, so
    /// this filter applies to fact extraction; derived layers see every
    /// element regardless of origin.
    pub source: Option<JobSource>,
}

/// Final per-run accounting, printed at the end of every pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl RunReport {
    pub fn absorb(&mut self, other: RunReport) {
        self.processed += other.processed;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} processed, {} skipped, {} failed",
            self.processed, self.skipped, self.failed
        )
    }
}

// =============================================================================
// RAW UNITS
// =============================================================================

/// A raw conversational unit produced by a source connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSession {
    pub session_id: String,
    pub source: JobSource,
    pub content: String,
    pub recorded_at: DateTime<Utc>,
}

/// Watcher bookkeeping for one source file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEntry {
    pub path: String,
    /// SHA-256 of the file content at last sighting.
    pub checksum: String,
    pub mtime: DateTime<Utc>,
    /// Set once the transcript's facts were extracted.
    pub processed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::from_str_lossy(status.as_str()), status);
        }
    }

    #[test]
    fn test_job_status_unknown_fallback() {
        assert_eq!(JobStatus::from_str_lossy("bogus"), JobStatus::Pending);
        assert_eq!(JobStatus::from_str_lossy(""), JobStatus::Pending);
    }

    #[test]
    fn test_job_status_terminal() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn test_job_source_round_trip() {
        for source in [
            JobSource::ChatSync,
            JobSource::TranscriptWatch,
            JobSource::Backfill,
            JobSource::Manual,
        ] {
            assert_eq!(JobSource::from_str_lossy(source.as_str()), source);
        }
    }

    #[test]
    fn test_element_kind_prefixes_unique() {
        let prefixes = [
            ElementKind::Fact.prefix(),
            ElementKind::Theme.prefix(),
            ElementKind::Insight.prefix(),
            ElementKind::Document.prefix(),
        ];
        let mut sorted = prefixes.to_vec();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), prefixes.len());
    }

    #[test]
    fn test_element_kind_from_id() {
        assert_eq!(ElementKind::from_id("f_abc123"), Some(ElementKind::Fact));
        assert_eq!(ElementKind::from_id("t_abc123"), Some(ElementKind::Theme));
        assert_eq!(ElementKind::from_id("i_abc123"), Some(ElementKind::Insight));
        assert_eq!(
            ElementKind::from_id("d_abc123"),
            Some(ElementKind::Document)
        );
        assert_eq!(ElementKind::from_id("s_session"), None);
        assert_eq!(ElementKind::from_id(""), None);
    }

    #[test]
    fn test_synthesis_job_id_carries_type() {
        let job = SynthesisJob::new(SynthesisJobType::FullSynthesis, None);
        assert!(job.id.starts_with("full_synthesis_"));
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn test_synthesis_job_ids_unique_within_one_instant() {
        // Back-to-back creation lands in the same millisecond; ids must
        // still differ.
        let ids: std::collections::HashSet<String> = (0..100)
            .map(|_| SynthesisJob::new(SynthesisJobType::ProjectTracker, None).id)
            .collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn test_layer_parse_numeric_and_named() {
        assert_eq!(Layer::parse("1"), Some(Layer::Facts));
        assert_eq!(Layer::parse("facts"), Some(Layer::Facts));
        assert_eq!(Layer::parse("2"), Some(Layer::Themes));
        assert_eq!(Layer::parse("themes"), Some(Layer::Themes));
        assert_eq!(Layer::parse("3"), Some(Layer::Insights));
        assert_eq!(Layer::parse("4"), Some(Layer::Dossier));
        assert_eq!(Layer::parse("dossier"), Some(Layer::Dossier));
        assert_eq!(Layer::parse("5"), None);
        assert_eq!(Layer::parse(""), None);
    }

    #[test]
    fn test_run_report_absorb_and_display() {
        let mut report = RunReport {
            processed: 2,
            skipped: 1,
            failed: 0,
        };
        report.absorb(RunReport {
            processed: 1,
            skipped: 0,
            failed: 3,
        });
        assert_eq!(report.processed, 3);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 3);
        assert_eq!(report.to_string(), "3 processed, 1 skipped, 3 failed");
    }

    #[test]
    fn test_element_counts_total() {
        let counts = ElementCounts {
            facts: 10,
            themes: 3,
            insights: 2,
            documents: 1,
        };
        assert_eq!(counts.total(), 16);
    }

    #[test]
    fn test_worker_status_idle() {
        let status = WorkerStatus::idle(2);
        assert_eq!(status.worker_id, 2);
        assert_eq!(status.state, WorkerState::Idle);
        assert!(status.current_job_id.is_none());
    }
}
