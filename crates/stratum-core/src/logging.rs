//! Structured logging field name constants for stratum.
//!
//! All crates use these constants for consistent structured logging
//! fields, so log aggregation tools can query by standardized field names
//! across every subsystem.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events (startup, shutdown), run completions |
//! | DEBUG | Decision points, intermediate values, config choices |
//! | TRACE | Per-item iteration (facts, lineage edges) |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "db", "jobs", "pipeline", "watcher", "daemon", "inference"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "worker", "scheduler", "curator", "pool", "supervisor"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "dequeue", "extract_facts", "run_layer", "reset_stuck"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Enrichment job UUID being processed.
pub const JOB_ID: &str = "job_id";

/// Session identifier from the originating connector.
pub const SESSION_ID: &str = "session_id";

/// Origin system tag ("chat_sync", "transcript_watch", ...).
pub const SOURCE: &str = "source";

/// Knowledge element prefixed ID (f_/t_/i_/d_).
pub const ELEMENT_ID: &str = "element_id";

/// Pipeline layer being run ("facts", "themes", "insights", "dossier").
pub const LAYER: &str = "layer";

/// Synthesis job ID (type + timestamp).
pub const SYNTHESIS_JOB_ID: &str = "synthesis_job_id";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Pending jobs visible at the moment of the event.
pub const QUEUE_DEPTH: &str = "queue_depth";

/// Units processed in a run.
pub const PROCESSED: &str = "processed";

/// Units skipped in a run (content errors, already enriched).
pub const SKIPPED: &str = "skipped";

/// Units failed in a run.
pub const FAILED: &str = "failed";

/// Worker index within the pool.
pub const WORKER_ID: &str = "worker_id";
