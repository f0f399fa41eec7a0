//! Session provider over the chat-sync export directory.
//!
//! Chat-history sync runs outside this system and drops one JSON file
//! per session into an export directory. This provider is the only
//! bridge: it never talks to the chat service itself.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use stratum_core::{JobSource, RawSession, Result, SessionProvider};

const DEFAULT_EXPORT_DIR: &str = "./chat-exports";

/// Reads [`RawSession`] JSON files from the sync tool's export
/// directory.
pub struct ExportSessionProvider {
    dir: PathBuf,
}

impl ExportSessionProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory from `CHAT_EXPORT_DIR`, defaulting to
    /// `./chat-exports`.
    pub fn from_env() -> Self {
        let dir = std::env::var("CHAT_EXPORT_DIR")
            .unwrap_or_else(|_| DEFAULT_EXPORT_DIR.to_string());
        Self::new(dir)
    }

    /// All parseable sessions in the export directory, oldest first.
    /// Unreadable or malformed files are logged and skipped so one bad
    /// export never blocks the pipeline.
    async fn load_all(&self) -> Result<Vec<RawSession>> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) => {
                warn!(
                    subsystem = "daemon",
                    component = "sessions",
                    dir = %self.dir.display(),
                    error = %e,
                    "Chat export directory unreadable"
                );
                return Ok(Vec::new());
            }
        };

        let mut sessions = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(
                        subsystem = "daemon",
                        component = "sessions",
                        path = %path.display(),
                        error = %e,
                        "Export file unreadable, skipping"
                    );
                    continue;
                }
            };
            match serde_json::from_slice::<RawSession>(&bytes) {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    warn!(
                        subsystem = "daemon",
                        component = "sessions",
                        path = %path.display(),
                        error = %e,
                        "Export file is not a valid session, skipping"
                    );
                }
            }
        }

        sessions.sort_by_key(|s| s.recorded_at);
        Ok(sessions)
    }
}

#[async_trait]
impl SessionProvider for ExportSessionProvider {
    async fn fetch(&self, session_id: &str, source: JobSource) -> Result<Option<RawSession>> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .find(|s| s.session_id == session_id && s.source == source))
    }

    async fn list(
        &self,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
        source: Option<JobSource>,
    ) -> Result<Vec<RawSession>> {
        let mut sessions = self.load_all().await?;
        if let Some(cutoff) = since {
            sessions.retain(|s| s.recorded_at >= cutoff);
        }
        if let Some(wanted) = source {
            sessions.retain(|s| s.source == wanted);
        }
        if let Some(limit) = limit {
            sessions.truncate(limit);
        }
        Ok(sessions)
    }
}
