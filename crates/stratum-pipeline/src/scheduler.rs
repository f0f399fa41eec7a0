//! In-memory synthesis scheduling.
//!
//! Synthesis jobs are disposable: their output is re-derivable from
//! persisted facts, so the queue lives in memory and a restart simply
//! loses it — the next backlog scan or debounce cycle re-creates the
//! work. One serial worker drains the queue oldest-first; failures are
//! logged, never auto-retried.
//!
//! `schedule_synthesis` is a trailing-edge debounce: every call resets
//! a single deadline, and only when the window elapses without another
//! call does a `FullSynthesis` (plus its dependent `ProjectTracker`)
//! land on the queue. Bursts of source activity coalesce into one
//! synthesis pass.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, instrument};

use stratum_core::{defaults, JobStatus, Result, RunReport, SynthesisJob, SynthesisJobType};

/// Executes one synthesis job kind. Implemented by the pipeline;
/// dispatch over [`SynthesisJobType`] stays exhaustive in the runner.
#[async_trait]
pub trait SynthesisHandler: Send + Sync {
    async fn transcript_facts(&self, payload: Option<&JsonValue>) -> Result<RunReport>;
    async fn full_synthesis(&self) -> Result<RunReport>;
    async fn project_tracker(&self) -> Result<RunReport>;
    async fn regenerate_outputs(&self) -> Result<RunReport>;
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Trailing-edge debounce window in milliseconds.
    pub debounce_window_ms: u64,
    /// Serial worker poll interval when the queue is empty.
    pub poll_interval_ms: u64,
    /// How long finished jobs stay visible in snapshots.
    pub retention_minutes: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            debounce_window_ms: defaults::DEBOUNCE_WINDOW_MS,
            poll_interval_ms: defaults::SYNTHESIS_POLL_INTERVAL_MS,
            retention_minutes: defaults::SYNTHESIS_RETENTION_MINUTES,
        }
    }
}

/// A finished job kept around for snapshots until retention expires.
#[derive(Debug, Clone)]
struct FinishedJob {
    job: SynthesisJob,
    finished_at: chrono::DateTime<chrono::Utc>,
}

struct SchedulerInner {
    config: SchedulerConfig,
    queue: Mutex<VecDeque<SynthesisJob>>,
    finished: Mutex<Vec<FinishedJob>>,
    /// Debounce deadline; every `schedule_synthesis` call pushes it out.
    deadline: Mutex<Option<Instant>>,
    notify: Notify,
}

/// Handle onto the in-memory synthesis queue. Cheap to clone.
#[derive(Clone)]
pub struct SynthesisScheduler {
    inner: Arc<SchedulerInner>,
}

impl SynthesisScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                queue: Mutex::new(VecDeque::new()),
                finished: Mutex::new(Vec::new()),
                deadline: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    /// Enqueue a synthesis job. At most one `FullSynthesis` may be
    /// pending at a time; a duplicate returns `None`.
    pub fn enqueue(
        &self,
        job_type: SynthesisJobType,
        payload: Option<JsonValue>,
    ) -> Option<String> {
        let mut queue = self.inner.queue.lock().unwrap();
        if job_type == SynthesisJobType::FullSynthesis
            && queue.iter().any(|j| j.job_type == SynthesisJobType::FullSynthesis)
        {
            debug!(
                subsystem = "pipeline",
                component = "scheduler",
                "FullSynthesis already pending, deduplicated"
            );
            return None;
        }

        let job = SynthesisJob::new(job_type, payload);
        let id = job.id.clone();
        debug!(
            subsystem = "pipeline",
            component = "scheduler",
            synthesis_job_id = %id,
            job_type = job_type.as_str(),
            queue_depth = queue.len() + 1,
            "Synthesis job enqueued"
        );
        queue.push_back(job);
        Some(id)
    }

    /// Reset the debounce timer. When the window elapses uninterrupted
    /// the debounce loop enqueues a `FullSynthesis` and its dependent
    /// `ProjectTracker`.
    pub fn schedule_synthesis(&self) {
        let window = Duration::from_millis(self.inner.config.debounce_window_ms);
        *self.inner.deadline.lock().unwrap() = Some(Instant::now() + window);
        self.inner.notify.notify_one();
    }

    /// Number of jobs waiting to run.
    pub fn pending_count(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }

    /// Pending jobs plus recently finished ones, for health reports.
    pub fn snapshot(&self) -> Vec<SynthesisJob> {
        let mut jobs: Vec<SynthesisJob> =
            self.inner.queue.lock().unwrap().iter().cloned().collect();
        jobs.extend(
            self.inner
                .finished
                .lock()
                .unwrap()
                .iter()
                .map(|f| f.job.clone()),
        );
        jobs
    }

    fn take_next(&self) -> Option<SynthesisJob> {
        let mut queue = self.inner.queue.lock().unwrap();
        queue.pop_front().map(|mut job| {
            job.status = JobStatus::Processing;
            job
        })
    }

    fn finish(&self, mut job: SynthesisJob, status: JobStatus) {
        job.status = status;
        let retention = chrono::Duration::minutes(self.inner.config.retention_minutes);
        let cutoff = chrono::Utc::now() - retention;
        let mut finished = self.inner.finished.lock().unwrap();
        finished.retain(|f| f.finished_at > cutoff);
        finished.push(FinishedJob {
            job,
            finished_at: chrono::Utc::now(),
        });
    }

    /// Spawn the debounce loop and the serial worker. Both exit on the
    /// shutdown signal.
    pub fn start(
        &self,
        handler: Arc<dyn SynthesisHandler>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let debounce = {
            let scheduler = self.clone();
            let rx = shutdown_rx.clone();
            tokio::spawn(async move {
                scheduler.debounce_loop(rx).await;
            })
        };
        let runner = {
            let scheduler = self.clone();
            tokio::spawn(async move {
                scheduler.run_loop(handler, shutdown_rx).await;
            })
        };
        vec![debounce, runner]
    }

    async fn debounce_loop(&self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            // Wait until something schedules a synthesis.
            tokio::select! {
                _ = self.inner.notify.notified() => {}
                _ = shutdown_rx.changed() => return,
            }

            // Sleep to the deadline, re-checking after every wake so a
            // schedule call during the window extends it.
            loop {
                let deadline = *self.inner.deadline.lock().unwrap();
                let Some(deadline) = deadline else { break };
                if Instant::now() >= deadline {
                    *self.inner.deadline.lock().unwrap() = None;
                    info!(
                        subsystem = "pipeline",
                        component = "scheduler",
                        "Debounce window elapsed, scheduling full synthesis"
                    );
                    if self.enqueue(SynthesisJobType::FullSynthesis, None).is_some() {
                        self.enqueue(SynthesisJobType::ProjectTracker, None);
                    }
                    break;
                }
                tokio::select! {
                    _ = sleep_until(deadline) => {}
                    _ = self.inner.notify.notified() => {}
                    _ = shutdown_rx.changed() => return,
                }
            }
        }
    }

    #[instrument(skip(self, handler, shutdown_rx), fields(subsystem = "pipeline", component = "scheduler"))]
    async fn run_loop(
        &self,
        handler: Arc<dyn SynthesisHandler>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let poll = Duration::from_millis(self.inner.config.poll_interval_ms);
        loop {
            if *shutdown_rx.borrow() {
                return;
            }

            let Some(job) = self.take_next() else {
                tokio::select! {
                    _ = sleep(poll) => continue,
                    _ = shutdown_rx.changed() => return,
                }
            };

            info!(
                subsystem = "pipeline",
                component = "scheduler",
                synthesis_job_id = %job.id,
                job_type = job.job_type.as_str(),
                "Running synthesis job"
            );

            let result = match job.job_type {
                SynthesisJobType::TranscriptFacts => {
                    handler.transcript_facts(job.payload.as_ref()).await
                }
                SynthesisJobType::FullSynthesis => handler.full_synthesis().await,
                SynthesisJobType::ProjectTracker => handler.project_tracker().await,
                SynthesisJobType::RegenerateOutputs => handler.regenerate_outputs().await,
            };

            match result {
                Ok(report) => {
                    info!(
                        subsystem = "pipeline",
                        component = "scheduler",
                        synthesis_job_id = %job.id,
                        processed = report.processed,
                        skipped = report.skipped,
                        failed = report.failed,
                        "Synthesis job completed"
                    );
                    self.finish(job, JobStatus::Completed);
                }
                // No retry: the next debounce cycle redoes this work
                // from durable facts anyway.
                Err(e) => {
                    error!(
                        subsystem = "pipeline",
                        component = "scheduler",
                        synthesis_job_id = %job.id,
                        error = %e,
                        "Synthesis job failed"
                    );
                    self.finish(job, JobStatus::Failed);
                }
            }
        }
    }
}

impl Default for SynthesisScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}
