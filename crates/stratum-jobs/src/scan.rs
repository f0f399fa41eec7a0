//! Session discovery: the producer side of the enrichment queue.
//!
//! Lists every session the connector currently knows and enqueues an
//! enrichment job for each one without facts on record. The queue's
//! `(session_id, source)` dedup makes repeat scans free, so the daemon
//! runs this at startup and on a routine interval.

use std::sync::Arc;

use tracing::{debug, info};

use stratum_core::{ids, ElementRepository, JobRepository, Result, SessionProvider};

pub struct SessionScanner {
    sessions: Arc<dyn SessionProvider>,
    elements: Arc<dyn ElementRepository>,
    jobs: Arc<dyn JobRepository>,
}

impl SessionScanner {
    pub fn new(
        sessions: Arc<dyn SessionProvider>,
        elements: Arc<dyn ElementRepository>,
        jobs: Arc<dyn JobRepository>,
    ) -> Self {
        Self {
            sessions,
            elements,
            jobs,
        }
    }

    /// Enqueue an enrichment job, at the given priority, for every
    /// session without facts on record. Returns the number of jobs
    /// actually enqueued (deduplicated enqueues do not count).
    pub async fn scan(&self, priority: i32) -> Result<usize> {
        let sessions = self.sessions.list(None, None, None).await?;
        let mut enqueued = 0;

        for raw in &sessions {
            let root = ids::session_ref(&raw.session_id, raw.source);
            if self.elements.has_elements_for_root(&root).await? {
                continue;
            }
            if let Some(job_id) = self
                .jobs
                .enqueue(&raw.session_id, raw.source, priority)
                .await?
            {
                debug!(
                    subsystem = "jobs",
                    component = "scanner",
                    job_id = %job_id,
                    session_id = %raw.session_id,
                    source = raw.source.as_str(),
                    priority,
                    "Enqueued unenriched session"
                );
                enqueued += 1;
            }
        }

        if enqueued > 0 {
            info!(
                subsystem = "jobs",
                component = "scanner",
                scanned = sessions.len(),
                enqueued,
                "Session scan found unenriched sessions"
            );
        }
        Ok(enqueued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::collections::HashSet;
    use std::sync::Mutex;
    use stratum_core::{
        defaults, ElementCounts, EnrichmentJob, JobSource, KnowledgeElement, LineageEdge,
        QueueStats, RawSession, UpsertOutcome,
    };
    use uuid::Uuid;

    struct StubSessions {
        sessions: Vec<RawSession>,
    }

    #[async_trait]
    impl SessionProvider for StubSessions {
        async fn fetch(&self, _session_id: &str, _source: JobSource) -> Result<Option<RawSession>> {
            unimplemented!("not used by the scanner")
        }

        async fn list(
            &self,
            _since: Option<DateTime<Utc>>,
            _limit: Option<usize>,
            _source: Option<JobSource>,
        ) -> Result<Vec<RawSession>> {
            Ok(self.sessions.clone())
        }
    }

    /// Element double that only answers coverage lookups.
    #[derive(Default)]
    struct CoveredRoots {
        covered: HashSet<String>,
    }

    #[async_trait]
    impl ElementRepository for CoveredRoots {
        async fn upsert(
            &self,
            _element: KnowledgeElement,
            _parents: &[LineageEdge],
        ) -> Result<UpsertOutcome> {
            unimplemented!("not used by the scanner")
        }

        async fn get(&self, _id: &str) -> Result<Option<KnowledgeElement>> {
            unimplemented!("not used by the scanner")
        }

        async fn list_kind(
            &self,
            _kind: stratum_core::ElementKind,
        ) -> Result<Vec<KnowledgeElement>> {
            unimplemented!("not used by the scanner")
        }

        async fn list_kind_since(
            &self,
            _kind: stratum_core::ElementKind,
            _since: DateTime<Utc>,
        ) -> Result<Vec<KnowledgeElement>> {
            unimplemented!("not used by the scanner")
        }

        async fn facts_without_theme(&self) -> Result<Vec<KnowledgeElement>> {
            unimplemented!("not used by the scanner")
        }

        async fn parents_of(&self, _id: &str) -> Result<Vec<LineageEdge>> {
            unimplemented!("not used by the scanner")
        }

        async fn children_of(&self, _parent_ref: &str) -> Result<Vec<LineageEdge>> {
            unimplemented!("not used by the scanner")
        }

        async fn has_elements_for_root(&self, root_ref: &str) -> Result<bool> {
            Ok(self.covered.contains(root_ref))
        }

        async fn supersede_documents(&self, _except_id: &str, _profile: &str) -> Result<i64> {
            unimplemented!("not used by the scanner")
        }

        async fn counts(&self) -> Result<ElementCounts> {
            unimplemented!("not used by the scanner")
        }
    }

    /// Queue double that records enqueues and deduplicates like the
    /// real store.
    #[derive(Default)]
    struct RecordingQueue {
        enqueued: Mutex<Vec<(String, JobSource, i32)>>,
    }

    #[async_trait]
    impl JobRepository for RecordingQueue {
        async fn enqueue(
            &self,
            session_id: &str,
            source: JobSource,
            priority: i32,
        ) -> Result<Option<Uuid>> {
            let mut enqueued = self.enqueued.lock().unwrap();
            if enqueued.iter().any(|(s, src, _)| s == session_id && *src == source) {
                return Ok(None);
            }
            enqueued.push((session_id.to_string(), source, priority));
            Ok(Some(Uuid::now_v7()))
        }

        async fn dequeue(&self, _n: i64) -> Result<Vec<EnrichmentJob>> {
            unimplemented!("not used by the scanner")
        }

        async fn complete(&self, _job_id: Uuid) -> Result<()> {
            unimplemented!("not used by the scanner")
        }

        async fn complete_skipped(&self, _job_id: Uuid, _reason: &str) -> Result<()> {
            unimplemented!("not used by the scanner")
        }

        async fn fail(&self, _job_id: Uuid, _error: &str) -> Result<()> {
            unimplemented!("not used by the scanner")
        }

        async fn requeue(&self, _job_id: Uuid) -> Result<()> {
            unimplemented!("not used by the scanner")
        }

        async fn reset_stuck(&self, _staleness: chrono::Duration) -> Result<i64> {
            unimplemented!("not used by the scanner")
        }

        async fn clear_old(&self, _days: i64) -> Result<i64> {
            unimplemented!("not used by the scanner")
        }

        async fn get(&self, _job_id: Uuid) -> Result<Option<EnrichmentJob>> {
            unimplemented!("not used by the scanner")
        }

        async fn list_for_source(&self, _source: JobSource) -> Result<Vec<EnrichmentJob>> {
            unimplemented!("not used by the scanner")
        }

        async fn pending_count(&self) -> Result<i64> {
            Ok(self.enqueued.lock().unwrap().len() as i64)
        }

        async fn stats(&self) -> Result<QueueStats> {
            unimplemented!("not used by the scanner")
        }

        async fn orphaned_completed(&self) -> Result<Vec<EnrichmentJob>> {
            unimplemented!("not used by the scanner")
        }
    }

    fn raw(id: &str) -> RawSession {
        RawSession {
            session_id: id.to_string(),
            source: JobSource::ChatSync,
            content: "content".to_string(),
            recorded_at: Utc::now(),
        }
    }

    fn scanner_with(
        sessions: Vec<RawSession>,
        covered: HashSet<String>,
    ) -> (SessionScanner, Arc<RecordingQueue>) {
        let queue = Arc::new(RecordingQueue::default());
        let scanner = SessionScanner::new(
            Arc::new(StubSessions { sessions }),
            Arc::new(CoveredRoots { covered }),
            queue.clone(),
        );
        (scanner, queue)
    }

    #[tokio::test]
    async fn test_scan_enqueues_only_unenriched_sessions() {
        let covered: HashSet<String> =
            [ids::session_ref("done", JobSource::ChatSync)].into_iter().collect();
        let (scanner, queue) = scanner_with(vec![raw("fresh-a"), raw("done"), raw("fresh-b")], covered);

        let enqueued = scanner.scan(defaults::PRIORITY_BACKLOG).await.unwrap();
        assert_eq!(enqueued, 2);

        let jobs = queue.enqueued.lock().unwrap();
        let sessions: Vec<&str> = jobs.iter().map(|(s, _, _)| s.as_str()).collect();
        assert_eq!(sessions, ["fresh-a", "fresh-b"]);
        assert!(jobs.iter().all(|(_, _, p)| *p == defaults::PRIORITY_BACKLOG));
    }

    #[tokio::test]
    async fn test_rescan_is_deduplicated_by_the_queue() {
        let (scanner, queue) = scanner_with(vec![raw("s1"), raw("s2")], HashSet::new());

        assert_eq!(scanner.scan(defaults::PRIORITY_BACKLOG).await.unwrap(), 2);
        assert_eq!(scanner.scan(defaults::PRIORITY_ROUTINE).await.unwrap(), 0);
        assert_eq!(queue.enqueued.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_connector_enqueues_nothing() {
        let (scanner, queue) = scanner_with(Vec::new(), HashSet::new());
        assert_eq!(scanner.scan(defaults::PRIORITY_ROUTINE).await.unwrap(), 0);
        assert!(queue.enqueued.lock().unwrap().is_empty());
    }
}
