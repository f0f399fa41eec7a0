//! Enrichment worker pool.
//!
//! `WORKER_COUNT` independent tokio tasks poll the durable queue, each
//! claiming one job at a time. The store's atomic claim is the only
//! mutual-exclusion mechanism; the workers share nothing but a status
//! board used for observability.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use stratum_core::{
    defaults, EnrichOutcome, EnrichmentJob, JobRepository, SessionEnricher, WorkerState,
    WorkerStatus,
};

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent workers.
    pub worker_count: usize,
    /// Polling interval when the queue is empty, in milliseconds.
    pub poll_interval_ms: u64,
    /// Delay after every processed job, success or not.
    pub rate_limit_delay_ms: u64,
    /// Extra sleep after a job failure before the next poll.
    pub failure_backoff_ms: u64,
    /// Whether to start workers at all.
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: defaults::WORKER_COUNT,
            poll_interval_ms: defaults::POLL_INTERVAL_MS,
            rate_limit_delay_ms: defaults::RATE_LIMIT_DELAY_MS,
            failure_backoff_ms: defaults::FAILURE_BACKOFF_MS,
            enabled: true,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `WORKER_ENABLED` | `true` | Enable/disable the pool |
    /// | `WORKER_COUNT` | `3` | Number of workers |
    /// | `POLL_INTERVAL_MS` | `5000` | Polling interval when queue is empty |
    /// | `RATE_LIMIT_DELAY_MS` | `1000` | Delay after each processed job |
    /// | `FAILURE_BACKOFF_MS` | `15000` | Extra sleep after a failure |
    pub fn from_env() -> Self {
        let enabled = std::env::var("WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let worker_count = std::env::var("WORKER_COUNT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::WORKER_COUNT)
            .max(1);

        let poll_interval_ms = std::env::var("POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::POLL_INTERVAL_MS);

        let rate_limit_delay_ms = std::env::var("RATE_LIMIT_DELAY_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::RATE_LIMIT_DELAY_MS);

        let failure_backoff_ms = std::env::var("FAILURE_BACKOFF_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::FAILURE_BACKOFF_MS);

        Self {
            worker_count,
            poll_interval_ms,
            rate_limit_delay_ms,
            failure_backoff_ms,
            enabled,
        }
    }

    pub fn with_worker_count(mut self, n: usize) -> Self {
        self.worker_count = n.max(1);
        self
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_rate_limit_delay(mut self, ms: u64) -> Self {
        self.rate_limit_delay_ms = ms;
        self
    }

    pub fn with_failure_backoff(mut self, ms: u64) -> Self {
        self.failure_backoff_ms = ms;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Shared status board: one slot per worker, rewritten every cycle.
pub type StatusBoard = Arc<RwLock<Vec<WorkerStatus>>>;

/// Handle for controlling a running pool.
pub struct PoolHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    statuses: StatusBoard,
}

impl PoolHandle {
    /// Snapshot of all worker statuses.
    pub async fn statuses(&self) -> Vec<WorkerStatus> {
        self.statuses.read().await.clone()
    }

    /// Signal shutdown and wait for workers to finish their current
    /// jobs, up to a hard timeout.
    pub async fn shutdown(self) {
        info!(
            subsystem = "jobs",
            component = "worker_pool",
            "Shutting down worker pool"
        );
        let _ = self.shutdown_tx.send(true);

        let joins = futures::future::join_all(self.tasks);
        let timeout = Duration::from_secs(defaults::SHUTDOWN_TIMEOUT_SECS);
        match tokio::time::timeout(timeout, joins).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!(error = ?e, "Worker task panicked");
                    }
                }
                info!(
                    subsystem = "jobs",
                    component = "worker_pool",
                    "Worker pool stopped"
                );
            }
            Err(_) => {
                warn!(
                    subsystem = "jobs",
                    component = "worker_pool",
                    timeout_secs = defaults::SHUTDOWN_TIMEOUT_SECS,
                    "Worker pool shutdown timed out, abandoning tasks"
                );
            }
        }
    }
}

/// The enrichment worker pool.
pub struct WorkerPool {
    jobs: Arc<dyn JobRepository>,
    enricher: Arc<dyn SessionEnricher>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        enricher: Arc<dyn SessionEnricher>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            jobs,
            enricher,
            config,
        }
    }

    /// Spawn all workers and return a control handle. When disabled,
    /// the handle holds no tasks and shutdown is a no-op.
    pub fn start(self) -> PoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        if !self.config.enabled {
            info!(
                subsystem = "jobs",
                component = "worker_pool",
                "Worker pool is disabled, not starting"
            );
            return PoolHandle {
                shutdown_tx,
                tasks: Vec::new(),
                statuses: Arc::new(RwLock::new(Vec::new())),
            };
        }

        let statuses: StatusBoard = Arc::new(RwLock::new(
            (0..self.config.worker_count).map(WorkerStatus::idle).collect(),
        ));

        info!(
            subsystem = "jobs",
            component = "worker_pool",
            worker_count = self.config.worker_count,
            poll_interval_ms = self.config.poll_interval_ms,
            "Worker pool started"
        );

        let tasks = (0..self.config.worker_count)
            .map(|worker_id| {
                let worker = Worker {
                    worker_id,
                    jobs: self.jobs.clone(),
                    enricher: self.enricher.clone(),
                    config: self.config.clone(),
                    statuses: statuses.clone(),
                };
                let rx = shutdown_rx.clone();
                tokio::spawn(async move {
                    worker.run(rx).await;
                })
            })
            .collect();

        PoolHandle {
            shutdown_tx,
            tasks,
            statuses,
        }
    }
}

/// One polling worker. Claims a single job per cycle; claim atomicity
/// in the store guarantees no two workers hold the same job.
struct Worker {
    worker_id: usize,
    jobs: Arc<dyn JobRepository>,
    enricher: Arc<dyn SessionEnricher>,
    config: WorkerConfig,
    statuses: StatusBoard,
}

impl Worker {
    #[instrument(skip(self, shutdown_rx), fields(worker_id = self.worker_id))]
    async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let rate_limit = Duration::from_millis(self.config.rate_limit_delay_ms);
        let backoff = Duration::from_millis(self.config.failure_backoff_ms);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let job = match self.jobs.dequeue(1).await {
                Ok(mut jobs) => jobs.pop(),
                Err(e) => {
                    error!(
                        subsystem = "jobs",
                        worker_id = self.worker_id,
                        error = %e,
                        "Failed to claim job"
                    );
                    self.publish(WorkerState::Sleeping, None, None).await;
                    if self.pause(backoff, &mut shutdown_rx).await {
                        break;
                    }
                    continue;
                }
            };

            match job {
                Some(job) => {
                    self.publish(
                        WorkerState::Processing,
                        Some(job.id),
                        Some(job.session_id.clone()),
                    )
                    .await;
                    let failed = self.process(job).await;

                    self.publish(WorkerState::Sleeping, None, None).await;
                    // Rate-limit delay applies to every processed job.
                    if self.pause(rate_limit, &mut shutdown_rx).await {
                        break;
                    }
                    if failed && self.pause(backoff, &mut shutdown_rx).await {
                        break;
                    }
                }
                None => {
                    self.publish(WorkerState::Idle, None, None).await;
                    if self.pause(poll_interval, &mut shutdown_rx).await {
                        break;
                    }
                }
            }
        }

        debug!(
            subsystem = "jobs",
            worker_id = self.worker_id,
            "Worker exited"
        );
    }

    /// Run the enricher for one claimed job, recording the outcome in
    /// the queue. Returns true when the job failed.
    async fn process(&self, job: EnrichmentJob) -> bool {
        let start = Instant::now();
        info!(
            subsystem = "jobs",
            worker_id = self.worker_id,
            job_id = %job.id,
            session_id = %job.session_id,
            source = job.source.as_str(),
            "Processing enrichment job"
        );

        match self.enricher.enrich(&job.session_id, job.source).await {
            Ok(EnrichOutcome::Enriched { facts }) => {
                if let Err(e) = self.jobs.complete(job.id).await {
                    error!(error = %e, job_id = %job.id, "Failed to mark job completed");
                    return true;
                }
                info!(
                    subsystem = "jobs",
                    worker_id = self.worker_id,
                    job_id = %job.id,
                    facts,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Enrichment completed"
                );
                false
            }
            // A skip is terminal success: retrying would skip again. The
            // annotation is persisted so orphan detection leaves the job
            // alone.
            Ok(EnrichOutcome::Skipped { reason }) => {
                if let Err(e) = self.jobs.complete_skipped(job.id, &reason).await {
                    error!(error = %e, job_id = %job.id, "Failed to mark job skipped");
                    return true;
                }
                info!(
                    subsystem = "jobs",
                    worker_id = self.worker_id,
                    job_id = %job.id,
                    reason = %reason,
                    "Enrichment skipped"
                );
                false
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(mark) = self.jobs.fail(job.id, &message).await {
                    error!(error = %mark, job_id = %job.id, "Failed to mark job failed");
                }
                warn!(
                    subsystem = "jobs",
                    worker_id = self.worker_id,
                    job_id = %job.id,
                    error = %message,
                    attempts = job.attempts + 1,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Enrichment failed"
                );
                true
            }
        }
    }

    /// Sleep, returning early — and true — when shutdown is signalled.
    async fn pause(&self, duration: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = sleep(duration) => false,
            _ = shutdown_rx.changed() => *shutdown_rx.borrow(),
        }
    }

    async fn publish(
        &self,
        state: WorkerState,
        job_id: Option<uuid::Uuid>,
        session_id: Option<String>,
    ) {
        let mut board = self.statuses.write().await;
        if let Some(slot) = board.get_mut(self.worker_id) {
            *slot = WorkerStatus {
                worker_id: self.worker_id,
                state,
                current_job_id: job_id,
                current_session_id: session_id,
                last_heartbeat: chrono::Utc::now(),
            };
        }
    }
}
