//! Centralized default constants for the stratum system.
//!
//! **This module is the single source of truth** for all shared default
//! values. All crates and the daemon binary reference these constants
//! instead of defining their own magic numbers.
//!
//! Organized by domain area. When adding new constants, place them in the
//! appropriate section and document the rationale for the chosen value.

// =============================================================================
// ENRICHMENT WORKERS
// =============================================================================

/// Number of parallel enrichment workers (`WORKER_COUNT` env override).
pub const WORKER_COUNT: usize = 3;

/// Polling interval when the queue is empty (`POLL_INTERVAL_MS` env override).
pub const POLL_INTERVAL_MS: u64 = 5_000;

/// Fixed delay after every processed job, to stay under the reasoning
/// service's rate limit.
pub const RATE_LIMIT_DELAY_MS: u64 = 1_000;

/// Extra sleep after a job failure, before the worker's next poll.
pub const FAILURE_BACKOFF_MS: u64 = 15_000;

/// Hard limit for graceful shutdown convergence. Liveness wins over
/// completing an in-flight job.
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// ENRICHMENT QUEUE
// =============================================================================

/// Jobs stuck in `processing` longer than this are presumed crashed.
pub const STUCK_THRESHOLD_MINUTES: i64 = 30;

/// Retention window for terminal (completed/failed) enrichment jobs.
pub const JOB_RETENTION_DAYS: i64 = 14;

/// Priority for operator-triggered work. Lower = more urgent.
pub const PRIORITY_INTERACTIVE: i32 = 1;

/// Priority for backlog catch-up scans.
pub const PRIORITY_BACKLOG: i32 = 3;

/// Priority for routine polling discoveries.
pub const PRIORITY_ROUTINE: i32 = 5;

// =============================================================================
// SYNTHESIS
// =============================================================================

/// Trailing-edge debounce window before a change burst triggers one
/// full synthesis pass.
pub const DEBOUNCE_WINDOW_MS: u64 = 30_000;

/// Poll interval for the serial synthesis worker.
pub const SYNTHESIS_POLL_INTERVAL_MS: u64 = 2_000;

/// Failed/completed synthesis jobs older than this are aged out of the
/// in-memory queue.
pub const SYNTHESIS_RETENTION_MINUTES: i64 = 60;

// =============================================================================
// CHANGE WATCHER
// =============================================================================

/// Poll interval for the transcript directory scan.
pub const WATCH_POLL_INTERVAL_SECS: u64 = 30;

// =============================================================================
// SUPERVISOR
// =============================================================================

/// Interval between health reports (queue stats + worker statuses).
pub const HEALTH_INTERVAL_SECS: u64 = 60;

/// Interval between maintenance sweeps (stuck-job reset, retention cleanup).
pub const MAINTENANCE_INTERVAL_SECS: u64 = 600;

/// Interval between session scans that feed the enrichment queue.
pub const SESSION_SCAN_INTERVAL_SECS: u64 = 300;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering_is_urgency_descending() {
        // Lower number = more urgent; interactive must beat backlog must
        // beat routine.
        assert!(PRIORITY_INTERACTIVE < PRIORITY_BACKLOG);
        assert!(PRIORITY_BACKLOG < PRIORITY_ROUTINE);
    }

    #[test]
    fn test_backoff_exceeds_rate_limit_delay() {
        assert!(FAILURE_BACKOFF_MS > RATE_LIMIT_DELAY_MS);
    }
}
