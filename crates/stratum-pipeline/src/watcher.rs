//! Transcript directory watcher.
//!
//! Polls a directory, compares each file's SHA-256 checksum and mtime
//! against the durable `watch_state` table, and turns new or changed
//! files into `TranscriptFacts` synthesis jobs plus a debounced full
//! synthesis. No inotify: the poll interval is long and the state is
//! durable, so polling survives missed events and restarts.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use stratum_core::{defaults, Result, SynthesisJobType, WatchEntry, WatchStateRepository};

use crate::scheduler::SynthesisScheduler;

/// SHA-256 checksum of file content, hex-encoded.
pub fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Directory holding transcript files.
    pub dir: PathBuf,
    /// Seconds between directory scans.
    pub poll_interval_secs: u64,
}

impl WatcherConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            poll_interval_secs: defaults::WATCH_POLL_INTERVAL_SECS,
        }
    }

    pub fn with_poll_interval(mut self, secs: u64) -> Self {
        self.poll_interval_secs = secs;
        self
    }
}

/// Watches one transcript directory and feeds the synthesis scheduler.
pub struct TranscriptWatcher {
    config: WatcherConfig,
    state: Arc<dyn WatchStateRepository>,
    scheduler: SynthesisScheduler,
}

impl TranscriptWatcher {
    pub fn new(
        config: WatcherConfig,
        state: Arc<dyn WatchStateRepository>,
        scheduler: SynthesisScheduler,
    ) -> Self {
        Self {
            config,
            state,
            scheduler,
        }
    }

    /// One-shot startup pass: enqueue every watched file never marked
    /// processed. Returns the number of files enqueued.
    #[instrument(skip(self), fields(subsystem = "pipeline", component = "watcher", op = "scan_backlog"))]
    pub async fn scan_backlog(&self) -> Result<usize> {
        let entries = self.state.list_unprocessed().await?;
        for entry in &entries {
            self.enqueue_transcript(&entry.path);
        }
        if !entries.is_empty() {
            info!(
                subsystem = "pipeline",
                component = "watcher",
                backlog = entries.len(),
                "Backlog scan enqueued unprocessed transcripts"
            );
            self.scheduler.schedule_synthesis();
        }
        Ok(entries.len())
    }

    /// Scan the directory once. Returns the number of new or changed
    /// files found.
    #[instrument(skip(self), fields(subsystem = "pipeline", component = "watcher", op = "scan_once"))]
    pub async fn scan_once(&self) -> Result<usize> {
        let mut dir = match tokio::fs::read_dir(&self.config.dir).await {
            Ok(dir) => dir,
            Err(e) => {
                warn!(
                    subsystem = "pipeline",
                    component = "watcher",
                    dir = %self.config.dir.display(),
                    error = %e,
                    "Watch directory unreadable"
                );
                return Ok(0);
            }
        };

        let mut changed = 0;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() || is_hidden(&path) {
                continue;
            }
            if self.check_file(&path).await? {
                changed += 1;
            }
        }

        if changed > 0 {
            info!(
                subsystem = "pipeline",
                component = "watcher",
                changed,
                "Detected transcript changes"
            );
            self.scheduler.schedule_synthesis();
        }
        Ok(changed)
    }

    /// Poll loop until shutdown.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.poll_interval_secs);
        loop {
            if *shutdown_rx.borrow() {
                return;
            }
            if let Err(e) = self.scan_once().await {
                warn!(
                    subsystem = "pipeline",
                    component = "watcher",
                    error = %e,
                    "Directory scan failed"
                );
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.changed() => return,
            }
        }
    }

    /// Compare one file against its recorded state; record and enqueue
    /// when new or changed. Returns true if the file changed.
    async fn check_file(&self, path: &Path) -> Result<bool> {
        let path_str = path.to_string_lossy().to_string();
        let bytes = tokio::fs::read(path).await?;
        let sum = checksum(&bytes);

        let known = self.state.get(&path_str).await?;
        if let Some(known) = &known {
            if known.checksum == sum {
                return Ok(false);
            }
        }

        let metadata = tokio::fs::metadata(path).await?;
        let mtime = metadata
            .modified()
            .map(chrono::DateTime::<chrono::Utc>::from)
            .unwrap_or_else(|_| chrono::Utc::now());

        debug!(
            subsystem = "pipeline",
            component = "watcher",
            path = %path_str,
            known = known.is_some(),
            "Transcript new or changed"
        );

        self.state
            .upsert(&WatchEntry {
                path: path_str.clone(),
                checksum: sum,
                mtime,
                processed_at: None,
            })
            .await?;
        self.enqueue_transcript(&path_str);
        Ok(true)
    }

    fn enqueue_transcript(&self, path: &str) {
        self.scheduler.enqueue(
            SynthesisJobType::TranscriptFacts,
            Some(serde_json::json!({ "path": path })),
        );
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_stable_and_content_sensitive() {
        let a = checksum(b"alpha");
        let b = checksum(b"alpha");
        let c = checksum(b"beta");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_hidden_files_detected() {
        assert!(is_hidden(Path::new("/tmp/.swap")));
        assert!(!is_hidden(Path::new("/tmp/notes.md")));
    }

    #[test]
    fn test_watcher_config_defaults() {
        let config = WatcherConfig::new("/var/transcripts");
        assert_eq!(config.poll_interval_secs, defaults::WATCH_POLL_INTERVAL_SECS);
        let config = config.with_poll_interval(5);
        assert_eq!(config.poll_interval_secs, 5);
    }
}
