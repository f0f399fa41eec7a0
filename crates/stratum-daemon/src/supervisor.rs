//! Long-running daemon supervision.
//!
//! Owns the process-level concerns: PID-file deduplication, signal
//! handling, the periodic health report and maintenance sweep, the
//! startup orphan re-queue, and graceful shutdown of the worker pool,
//! watcher, and synthesis loops.
//!
//! Signal handlers only forward: SIGUSR1 pushes a [`DaemonCommand`]
//! onto the inbound channel and the main loop does the actual work.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use stratum_core::{defaults, JobRepository, SynthesisJobType};
use stratum_db::Database;
use stratum_jobs::{SessionScanner, WorkerConfig, WorkerPool};
use stratum_pipeline::{
    Enricher, SynthesisScheduler, TranscriptWatcher, WatcherConfig,
};

use crate::Services;

/// Commands the main loop accepts from signal forwarders (and, later,
/// any other control surface).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonCommand {
    TriggerSynthesis,
    RegenerateOutputs,
}

/// Map trigger-file content onto a command. An empty, missing, or
/// unrecognized file requests a full synthesis; `regenerate` re-renders
/// documents from current insights without re-deriving the layers
/// beneath them.
fn parse_trigger(contents: &str) -> DaemonCommand {
    match contents.trim() {
        "regenerate" => DaemonCommand::RegenerateOutputs,
        _ => DaemonCommand::TriggerSynthesis,
    }
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub pid_file: PathBuf,
    pub trigger_file: PathBuf,
    pub transcript_dir: PathBuf,
    pub health_interval_secs: u64,
    pub maintenance_interval_secs: u64,
    pub session_scan_interval_secs: u64,
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        let env_path = |key: &str, default: &str| {
            PathBuf::from(std::env::var(key).unwrap_or_else(|_| default.to_string()))
        };
        Self {
            pid_file: env_path("STRATUM_PID_FILE", "/tmp/stratum-daemon.pid"),
            trigger_file: env_path("STRATUM_TRIGGER_FILE", "/tmp/stratum-synthesis.trigger"),
            transcript_dir: env_path("TRANSCRIPT_DIR", "./transcripts"),
            health_interval_secs: defaults::HEALTH_INTERVAL_SECS,
            maintenance_interval_secs: defaults::MAINTENANCE_INTERVAL_SECS,
            session_scan_interval_secs: defaults::SESSION_SCAN_INTERVAL_SECS,
        }
    }
}

/// Exclusive PID file, removed on drop.
///
/// A leftover file from a crashed daemon is detected by probing
/// `/proc/<pid>` and cleared; a live duplicate aborts startup.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn acquire(path: &Path) -> anyhow::Result<Self> {
        if let Ok(contents) = std::fs::read_to_string(path) {
            let pid = contents.trim().parse::<u32>().ok();
            match pid {
                Some(pid) if Path::new(&format!("/proc/{pid}")).exists() => {
                    bail!("daemon already running with pid {pid} ({})", path.display());
                }
                _ => {
                    warn!(
                        subsystem = "daemon",
                        component = "supervisor",
                        path = %path.display(),
                        "Removing stale PID file"
                    );
                    std::fs::remove_file(path).ok();
                }
            }
        }

        std::fs::write(path, std::process::id().to_string())
            .with_context(|| format!("writing PID file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        std::fs::remove_file(&self.path).ok();
    }
}

/// Re-queue Completed jobs whose facts never materialized. A crash
/// between queue completion and element persistence leaves this
/// inconsistency behind; the sweep heals it on the next startup.
async fn requeue_orphans(jobs: &dyn JobRepository) -> anyhow::Result<usize> {
    let orphans = jobs.orphaned_completed().await?;
    for job in &orphans {
        warn!(
            subsystem = "daemon",
            component = "supervisor",
            job_id = %job.id,
            session_id = %job.session_id,
            "Completed job has no facts on record, re-queueing"
        );
        jobs.requeue(job.id).await?;
    }
    Ok(orphans.len())
}

async fn health_report(services: &Services, pool: &stratum_jobs::PoolHandle, scheduler: &SynthesisScheduler) {
    let stats = match services.jobs.stats().await {
        Ok(stats) => stats,
        Err(e) => {
            error!(
                subsystem = "daemon",
                component = "supervisor",
                error = %e,
                "Health report failed to read queue stats"
            );
            return;
        }
    };
    let statuses = pool.statuses().await;
    let processing_now = statuses
        .iter()
        .filter(|s| s.state == stratum_core::WorkerState::Processing)
        .count();

    info!(
        subsystem = "daemon",
        component = "supervisor",
        op = "health",
        pending = stats.pending,
        processing = stats.processing,
        completed = stats.completed,
        failed = stats.failed,
        workers = statuses.len(),
        workers_busy = processing_now,
        synthesis_pending = scheduler.pending_count(),
        "Health report"
    );
}

/// Feed the enrichment queue: enqueue a job for every session without
/// facts on record, then nudge synthesis so the new facts get folded
/// into the derived layers.
async fn session_scan_sweep(
    scanner: &SessionScanner,
    scheduler: &SynthesisScheduler,
    priority: i32,
) {
    match scanner.scan(priority).await {
        Ok(0) => {}
        Ok(enqueued) => {
            info!(
                subsystem = "daemon",
                component = "supervisor",
                op = "scan",
                enqueued,
                priority,
                "Session scan enqueued enrichment jobs"
            );
            scheduler.schedule_synthesis();
        }
        Err(e) => error!(
            subsystem = "daemon",
            component = "supervisor",
            error = %e,
            "Session scan failed"
        ),
    }
}

async fn maintenance_sweep(services: &Services) {
    let staleness = chrono::Duration::minutes(defaults::STUCK_THRESHOLD_MINUTES);
    match services.jobs.reset_stuck(staleness).await {
        Ok(0) => {}
        Ok(reset) => warn!(
            subsystem = "daemon",
            component = "supervisor",
            op = "maintenance",
            reset,
            "Reset stuck processing jobs"
        ),
        Err(e) => error!(
            subsystem = "daemon",
            component = "supervisor",
            error = %e,
            "Stuck-job sweep failed"
        ),
    }

    match services.jobs.clear_old(defaults::JOB_RETENTION_DAYS).await {
        Ok(0) => {}
        Ok(cleared) => info!(
            subsystem = "daemon",
            component = "supervisor",
            op = "maintenance",
            cleared,
            "Cleared old terminal jobs"
        ),
        Err(e) => error!(
            subsystem = "daemon",
            component = "supervisor",
            error = %e,
            "Retention sweep failed"
        ),
    }
}

/// Run the daemon until SIGTERM/SIGINT.
pub async fn run(db: &Database, services: Services, config: DaemonConfig) -> anyhow::Result<()> {
    let _pid = PidFile::acquire(&config.pid_file)?;

    stratum_db::migrate(&db.pool).await?;
    let healed = requeue_orphans(services.jobs.as_ref()).await?;
    if healed > 0 {
        info!(
            subsystem = "daemon",
            component = "supervisor",
            healed,
            "Startup orphan sweep re-queued jobs"
        );
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (command_tx, mut command_rx) = mpsc::channel::<DaemonCommand>(16);

    // Synthesis scheduler and its serial worker.
    let scheduler = SynthesisScheduler::default();
    let mut tasks = scheduler.start(services.pipeline.clone(), shutdown_rx.clone());

    // Queue producer: sweep the backlog now, then on an interval.
    let scanner = SessionScanner::new(
        services.sessions.clone(),
        services.elements.clone(),
        services.jobs.clone(),
    );
    session_scan_sweep(&scanner, &scheduler, defaults::PRIORITY_BACKLOG).await;

    // Transcript watcher: backlog first, then the poll loop.
    let watcher = TranscriptWatcher::new(
        WatcherConfig::new(config.transcript_dir.clone()),
        services.watch.clone(),
        scheduler.clone(),
    );
    let backlog = watcher.scan_backlog().await?;
    if backlog > 0 {
        info!(
            subsystem = "daemon",
            component = "supervisor",
            backlog,
            "Backlog scan queued unprocessed transcripts"
        );
    }
    tasks.push({
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            watcher.run(rx).await;
        })
    });

    // Enrichment worker pool.
    let enricher = Arc::new(Enricher::new(
        services.sessions.clone(),
        services.reasoning.clone(),
        services.elements.clone(),
    ));
    let pool = WorkerPool::new(services.jobs.clone(), enricher, WorkerConfig::from_env()).start();

    // SIGUSR1 forwarder: read-and-delete the trigger file, push the
    // command. The handler never does the work itself.
    tasks.push({
        let trigger_file = config.trigger_file.clone();
        let command_tx = command_tx.clone();
        let mut rx = shutdown_rx.clone();
        let mut sigusr1 = signal(SignalKind::user_defined1())?;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sigusr1.recv() => {
                        let command = match tokio::fs::read_to_string(&trigger_file).await {
                            Ok(contents) => {
                                tokio::fs::remove_file(&trigger_file).await.ok();
                                info!(
                                    subsystem = "daemon",
                                    component = "supervisor",
                                    trigger = %trigger_file.display(),
                                    "Consumed synthesis trigger file"
                                );
                                parse_trigger(&contents)
                            }
                            // A bare signal without a trigger file still
                            // means "synthesize now".
                            Err(_) => DaemonCommand::TriggerSynthesis,
                        };
                        if command_tx.send(command).await.is_err() {
                            return;
                        }
                    }
                    _ = rx.changed() => return,
                }
            }
        })
    });

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut health = tokio::time::interval(Duration::from_secs(config.health_interval_secs));
    let mut maintenance =
        tokio::time::interval(Duration::from_secs(config.maintenance_interval_secs));
    let mut session_scan =
        tokio::time::interval(Duration::from_secs(config.session_scan_interval_secs));

    info!(
        subsystem = "daemon",
        component = "supervisor",
        pid = std::process::id(),
        "Daemon started"
    );

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!(subsystem = "daemon", component = "supervisor", "SIGTERM received");
                break;
            }
            _ = sigint.recv() => {
                info!(subsystem = "daemon", component = "supervisor", "SIGINT received");
                break;
            }
            Some(command) = command_rx.recv() => match command {
                DaemonCommand::TriggerSynthesis => {
                    info!(
                        subsystem = "daemon",
                        component = "supervisor",
                        "Synthesis triggered by command"
                    );
                    // An operator asked: pick up any sessions the routine
                    // sweep has not reached yet, ahead of the backlog.
                    if let Err(e) = scanner.scan(defaults::PRIORITY_INTERACTIVE).await {
                        error!(
                            subsystem = "daemon",
                            component = "supervisor",
                            error = %e,
                            "Interactive session scan failed"
                        );
                    }
                    scheduler.schedule_synthesis();
                }
                DaemonCommand::RegenerateOutputs => {
                    if let Some(job_id) =
                        scheduler.enqueue(SynthesisJobType::RegenerateOutputs, None)
                    {
                        info!(
                            subsystem = "daemon",
                            component = "supervisor",
                            job_id = %job_id,
                            "Output regeneration triggered by command"
                        );
                    }
                }
            },
            _ = health.tick() => health_report(&services, &pool, &scheduler).await,
            _ = maintenance.tick() => maintenance_sweep(&services).await,
            _ = session_scan.tick() => {
                session_scan_sweep(&scanner, &scheduler, defaults::PRIORITY_ROUTINE).await;
            }
        }
    }

    // Graceful shutdown: stop flag first, then wait for the pool's own
    // hard timeout, then the lightweight loops.
    let _ = shutdown_tx.send(true);
    pool.shutdown().await;
    for task in tasks {
        if let Err(e) = task.await {
            error!(subsystem = "daemon", component = "supervisor", error = ?e, "Task panicked");
        }
    }

    info!(subsystem = "daemon", component = "supervisor", "Daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");

        {
            let _pid = PidFile::acquire(&path).unwrap();
            let recorded: u32 = std::fs::read_to_string(&path).unwrap().trim().parse().unwrap();
            assert_eq!(recorded, std::process::id());

            // Our own live PID counts as a running daemon.
            assert!(PidFile::acquire(&path).is_err());
        }
        assert!(!path.exists());
    }

    #[test]
    fn stale_pid_file_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        // PID 0 never names a live process in /proc.
        std::fs::write(&path, "0").unwrap();

        let _pid = PidFile::acquire(&path).unwrap();
        let recorded: u32 = std::fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(recorded, std::process::id());
    }

    #[test]
    fn trigger_file_content_selects_the_command() {
        assert_eq!(parse_trigger("regenerate"), DaemonCommand::RegenerateOutputs);
        assert_eq!(parse_trigger("  regenerate\n"), DaemonCommand::RegenerateOutputs);
        assert_eq!(parse_trigger(""), DaemonCommand::TriggerSynthesis);
        assert_eq!(parse_trigger("full"), DaemonCommand::TriggerSynthesis);
        assert_eq!(parse_trigger("anything else"), DaemonCommand::TriggerSynthesis);
    }

    #[test]
    fn garbage_pid_file_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        std::fs::write(&path, "not-a-pid").unwrap();

        assert!(PidFile::acquire(&path).is_ok());
    }
}
