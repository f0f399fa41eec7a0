//! Behavioural tests for the layer pipeline, enricher, scheduler, and
//! watcher, running against in-memory repositories and the
//! deterministic mock reasoning backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::watch;

use stratum_core::{
    ids, ElementCounts, ElementKind, ElementRepository, EnrichOutcome, JobSource,
    KnowledgeElement, Layer, LineageEdge, PipelineOptions, RawSession, Result, RunReport,
    SessionEnricher, SessionProvider, SynthesisJobType, UpsertOutcome, WatchEntry,
    WatchStateRepository,
};
use stratum_inference::MockReasoning;
use stratum_pipeline::{
    Enricher, Pipeline, SchedulerConfig, SynthesisHandler, SynthesisScheduler,
    TranscriptWatcher, WatcherConfig, DOSSIER_PROFILES,
};

// ── In-memory doubles ──────────────────────────────────────────────────

#[derive(Default)]
struct InMemoryElements {
    by_id: Mutex<HashMap<String, KnowledgeElement>>,
    by_key: Mutex<HashMap<String, String>>,
    edges: Mutex<Vec<LineageEdge>>,
}

#[async_trait]
impl ElementRepository for InMemoryElements {
    async fn upsert(
        &self,
        element: KnowledgeElement,
        parents: &[LineageEdge],
    ) -> Result<UpsertOutcome> {
        let mut by_key = self.by_key.lock().unwrap();
        if let Some(existing_id) = by_key.get(&element.derivation_key) {
            let mut by_id = self.by_id.lock().unwrap();
            if let Some(existing) = by_id.get_mut(existing_id) {
                existing.content = element.content;
                existing.updated_at = Utc::now();
            }
            return Ok(UpsertOutcome::Unchanged(existing_id.clone()));
        }

        by_key.insert(element.derivation_key.clone(), element.id.clone());
        let id = element.id.clone();
        self.by_id.lock().unwrap().insert(id.clone(), element);

        let mut edges = self.edges.lock().unwrap();
        for edge in parents {
            let duplicate = edges
                .iter()
                .any(|e| e.child_id == edge.child_id && e.parent_ref == edge.parent_ref);
            if !duplicate {
                edges.push(edge.clone());
            }
        }
        Ok(UpsertOutcome::Inserted(id))
    }

    async fn get(&self, id: &str) -> Result<Option<KnowledgeElement>> {
        Ok(self.by_id.lock().unwrap().get(id).cloned())
    }

    async fn list_kind(&self, kind: ElementKind) -> Result<Vec<KnowledgeElement>> {
        let mut out: Vec<KnowledgeElement> = self
            .by_id
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.kind == kind && !e.superseded)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn list_kind_since(
        &self,
        kind: ElementKind,
        since: DateTime<Utc>,
    ) -> Result<Vec<KnowledgeElement>> {
        let mut out = self.list_kind(kind).await?;
        out.retain(|e| e.created_at > since);
        Ok(out)
    }

    async fn facts_without_theme(&self) -> Result<Vec<KnowledgeElement>> {
        let edges = self.edges.lock().unwrap();
        let covered: Vec<&str> = edges
            .iter()
            .filter(|e| e.child_id.starts_with("t_"))
            .map(|e| e.parent_ref.as_str())
            .collect();
        let mut out: Vec<KnowledgeElement> = self
            .by_id
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.kind == ElementKind::Fact && !covered.contains(&e.id.as_str()))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn parents_of(&self, id: &str) -> Result<Vec<LineageEdge>> {
        Ok(self
            .edges
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.child_id == id)
            .cloned()
            .collect())
    }

    async fn children_of(&self, parent_ref: &str) -> Result<Vec<LineageEdge>> {
        Ok(self
            .edges
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.parent_ref == parent_ref)
            .cloned()
            .collect())
    }

    async fn has_elements_for_root(&self, root_ref: &str) -> Result<bool> {
        Ok(self
            .edges
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.parent_ref == root_ref))
    }

    async fn supersede_documents(&self, except_id: &str, profile: &str) -> Result<i64> {
        let mut count = 0;
        for element in self.by_id.lock().unwrap().values_mut() {
            if element.kind == ElementKind::Document
                && element.id != except_id
                && !element.superseded
                && element.content.get("profile").and_then(|p| p.as_str()) == Some(profile)
            {
                element.superseded = true;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn counts(&self) -> Result<ElementCounts> {
        let mut counts = ElementCounts::default();
        for element in self.by_id.lock().unwrap().values() {
            if element.superseded {
                continue;
            }
            match element.kind {
                ElementKind::Fact => counts.facts += 1,
                ElementKind::Theme => counts.themes += 1,
                ElementKind::Insight => counts.insights += 1,
                ElementKind::Document => counts.documents += 1,
            }
        }
        Ok(counts)
    }
}

struct InMemorySessions {
    sessions: Vec<RawSession>,
}

#[async_trait]
impl SessionProvider for InMemorySessions {
    async fn fetch(&self, session_id: &str, source: JobSource) -> Result<Option<RawSession>> {
        Ok(self
            .sessions
            .iter()
            .find(|s| s.session_id == session_id && s.source == source)
            .cloned())
    }

    async fn list(
        &self,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
        source: Option<JobSource>,
    ) -> Result<Vec<RawSession>> {
        let mut out: Vec<RawSession> = self
            .sessions
            .iter()
            .filter(|s| since.map(|cutoff| s.recorded_at >= cutoff).unwrap_or(true))
            .filter(|s| source.map(|wanted| s.source == wanted).unwrap_or(true))
            .cloned()
            .collect();
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }
}

#[derive(Default)]
struct InMemoryWatchState {
    entries: Mutex<HashMap<String, WatchEntry>>,
}

#[async_trait]
impl WatchStateRepository for InMemoryWatchState {
    async fn get(&self, path: &str) -> Result<Option<WatchEntry>> {
        Ok(self.entries.lock().unwrap().get(path).cloned())
    }

    async fn upsert(&self, entry: &WatchEntry) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(entry.path.clone(), entry.clone());
        Ok(())
    }

    async fn mark_processed(&self, path: &str) -> Result<()> {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(path) {
            entry.processed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn list_unprocessed(&self) -> Result<Vec<WatchEntry>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.processed_at.is_none())
            .cloned()
            .collect())
    }
}

fn session(id: &str, content: &str) -> RawSession {
    RawSession {
        session_id: id.to_string(),
        source: JobSource::ChatSync,
        content: content.to_string(),
        recorded_at: Utc::now(),
    }
}

fn pipeline_with(
    sessions: Vec<RawSession>,
) -> (Pipeline, Arc<InMemoryElements>, Arc<MockReasoning>) {
    let elements = Arc::new(InMemoryElements::default());
    let reasoning = Arc::new(MockReasoning::new());
    let pipeline = Pipeline::new(
        elements.clone(),
        reasoning.clone(),
        Arc::new(InMemorySessions { sessions }),
        Arc::new(InMemoryWatchState::default()),
    );
    (pipeline, elements, reasoning)
}

// ── Enricher ───────────────────────────────────────────────────────────

#[tokio::test]
async fn enricher_persists_facts_with_session_lineage() {
    let elements = Arc::new(InMemoryElements::default());
    let enricher = Enricher::new(
        Arc::new(InMemorySessions {
            sessions: vec![session("s1", "we discussed the roadmap")],
        }),
        Arc::new(MockReasoning::new()),
        elements.clone(),
    );

    let outcome = enricher.enrich("s1", JobSource::ChatSync).await.unwrap();
    assert_eq!(outcome, EnrichOutcome::Enriched { facts: 2 });

    let root = ids::session_ref("s1", JobSource::ChatSync);
    let children = elements.children_of(&root).await.unwrap();
    assert_eq!(children.len(), 2);
    for edge in children {
        assert!(edge.child_id.starts_with("f_"));
    }
}

#[tokio::test]
async fn enricher_skips_missing_and_empty_sessions() {
    let enricher = Enricher::new(
        Arc::new(InMemorySessions {
            sessions: vec![session("empty", "   \n")],
        }),
        Arc::new(MockReasoning::new()),
        Arc::new(InMemoryElements::default()),
    );

    let missing = enricher.enrich("ghost", JobSource::ChatSync).await.unwrap();
    assert!(matches!(missing, EnrichOutcome::Skipped { .. }));

    let empty = enricher.enrich("empty", JobSource::ChatSync).await.unwrap();
    assert!(matches!(
        empty,
        EnrichOutcome::Skipped { ref reason } if reason == "empty content"
    ));
}

#[tokio::test]
async fn enricher_propagates_reasoning_failure() {
    let reasoning = Arc::new(MockReasoning::new());
    reasoning.fail_on("extract_facts");
    let enricher = Enricher::new(
        Arc::new(InMemorySessions {
            sessions: vec![session("s1", "content")],
        }),
        reasoning,
        Arc::new(InMemoryElements::default()),
    );

    assert!(enricher.enrich("s1", JobSource::ChatSync).await.is_err());
}

// ── Layer pipeline ─────────────────────────────────────────────────────

#[tokio::test]
async fn full_run_builds_all_four_layers() {
    let (pipeline, elements, _) = pipeline_with(vec![
        session("s1", "alpha discussion"),
        session("s2", "beta discussion"),
    ]);

    let report = pipeline
        .run_full(&PipelineOptions::default())
        .await
        .unwrap();
    assert_eq!(report.failed, 0);

    let counts = elements.counts().await.unwrap();
    assert_eq!(counts.facts, 4);
    assert_eq!(counts.themes, 1);
    assert_eq!(counts.insights, 1);
    assert_eq!(counts.documents, DOSSIER_PROFILES.len() as i64);
}

#[tokio::test]
async fn theme_rerun_over_unchanged_facts_creates_nothing() {
    let (pipeline, elements, _) = pipeline_with(vec![session("s1", "alpha")]);
    pipeline
        .run_full(&PipelineOptions {
            facts_only: true,
            ..PipelineOptions::default()
        })
        .await
        .unwrap();

    let first = pipeline
        .run_layer(stratum_core::Layer::Themes, &PipelineOptions::default())
        .await
        .unwrap();
    assert_eq!(first.processed, 1);

    let before = elements.counts().await.unwrap().themes;
    let second = pipeline
        .run_layer(stratum_core::Layer::Themes, &PipelineOptions::default())
        .await
        .unwrap();
    assert_eq!(second.processed, 0);
    assert_eq!(elements.counts().await.unwrap().themes, before);
}

#[tokio::test]
async fn derived_layers_honor_since_and_limit_filters() {
    let (pipeline, _, reasoning) = pipeline_with(vec![session("s1", "alpha discussion")]);
    pipeline
        .run_full(&PipelineOptions::default())
        .await
        .unwrap();
    let synth_calls = reasoning.call_count("synthesize_insights");
    let render_calls = reasoning.call_count("render_document");

    // A cutoff in the future leaves no candidate themes or insights, so
    // neither layer reaches the reasoning backend.
    let future = PipelineOptions {
        since: Some(Utc::now() + chrono::Duration::days(1)),
        ..PipelineOptions::default()
    };
    let insights = pipeline.run_layer(Layer::Insights, &future).await.unwrap();
    assert_eq!(insights.processed + insights.skipped + insights.failed, 0);
    let dossier = pipeline.run_layer(Layer::Dossier, &future).await.unwrap();
    assert_eq!(dossier.processed + dossier.skipped + dossier.failed, 0);
    assert_eq!(reasoning.call_count("synthesize_insights"), synth_calls);
    assert_eq!(reasoning.call_count("render_document"), render_calls);

    // Limit zero likewise empties the candidate set.
    let none = PipelineOptions {
        limit: Some(0),
        ..PipelineOptions::default()
    };
    pipeline.run_layer(Layer::Insights, &none).await.unwrap();
    pipeline.run_layer(Layer::Dossier, &none).await.unwrap();
    assert_eq!(reasoning.call_count("synthesize_insights"), synth_calls);
    assert_eq!(reasoning.call_count("render_document"), render_calls);
}

#[tokio::test]
async fn document_lineage_reaches_a_raw_root() {
    let (pipeline, elements, _) = pipeline_with(vec![session("s1", "alpha")]);
    pipeline
        .run_full(&PipelineOptions::default())
        .await
        .unwrap();

    let documents = elements.list_kind(ElementKind::Document).await.unwrap();
    assert!(!documents.is_empty());

    // In-process BFS from the document up through lineage; a visited
    // set bounds the walk even if the graph were cyclic.
    let mut frontier = vec![documents[0].id.clone()];
    let mut visited = Vec::new();
    let mut raw_roots = 0;
    while let Some(node) = frontier.pop() {
        if visited.contains(&node) {
            continue;
        }
        visited.push(node.clone());
        if ids::is_raw_ref(&node) {
            raw_roots += 1;
            continue;
        }
        for edge in elements.parents_of(&node).await.unwrap() {
            frontier.push(edge.parent_ref);
        }
    }
    assert!(raw_roots >= 1);
    assert!(visited.len() < 100);
}

#[tokio::test]
async fn new_document_generation_supersedes_previous() {
    let elements = Arc::new(InMemoryElements::default());
    let reasoning = Arc::new(MockReasoning::new());
    let sessions = Arc::new(InMemorySessions {
        sessions: vec![session("s1", "alpha"), session("s2", "beta")],
    });
    let watch = Arc::new(InMemoryWatchState::default());

    // First generation from one session only.
    let pipeline = Pipeline::new(
        elements.clone(),
        reasoning.clone(),
        Arc::new(InMemorySessions {
            sessions: vec![session("s1", "alpha")],
        }),
        watch.clone(),
    );
    pipeline
        .run_full(&PipelineOptions::default())
        .await
        .unwrap();

    // Second generation with more material: the insight set changes,
    // so each profile gets a new document and the old one retires.
    let pipeline = Pipeline::new(elements.clone(), reasoning, sessions, watch);
    pipeline
        .run_full(&PipelineOptions {
            force_reprocess: true,
            ..PipelineOptions::default()
        })
        .await
        .unwrap();

    let live = elements.list_kind(ElementKind::Document).await.unwrap();
    assert_eq!(live.len(), DOSSIER_PROFILES.len());
    for profile in DOSSIER_PROFILES {
        let for_profile = live
            .iter()
            .filter(|d| d.content["profile"] == *profile)
            .count();
        assert_eq!(for_profile, 1, "one live document per profile");
    }
}

#[tokio::test]
async fn dry_run_persists_nothing() {
    let (pipeline, elements, reasoning) = pipeline_with(vec![session("s1", "alpha")]);
    let report = pipeline
        .run_full(&PipelineOptions {
            dry_run: true,
            ..PipelineOptions::default()
        })
        .await
        .unwrap();

    assert_eq!(report.processed, 1);
    assert_eq!(elements.counts().await.unwrap().total(), 0);
    assert!(reasoning.calls().is_empty());
}

#[tokio::test]
async fn failed_unit_never_fails_the_run() {
    let (pipeline, elements, reasoning) =
        pipeline_with(vec![session("s1", "alpha"), session("s2", "beta")]);
    reasoning.fail_on("extract_facts");

    let report = pipeline
        .run_full(&PipelineOptions {
            facts_only: true,
            ..PipelineOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(report.failed, 2);
    assert_eq!(elements.counts().await.unwrap().facts, 0);
}

#[tokio::test]
async fn curator_is_a_noop_without_new_facts() {
    let (pipeline, _, _) = pipeline_with(vec![session("s1", "alpha")]);
    pipeline
        .run_full(&PipelineOptions::default())
        .await
        .unwrap();

    let report = pipeline
        .run_curator(&PipelineOptions::default())
        .await
        .unwrap();
    assert_eq!(report, RunReport {
        skipped: 1,
        ..RunReport::default()
    });
}

// ── Scheduler debounce ─────────────────────────────────────────────────

#[derive(Default)]
struct CountingHandler {
    transcripts: AtomicUsize,
    full: AtomicUsize,
    tracker: AtomicUsize,
    regen: AtomicUsize,
}

#[async_trait]
impl SynthesisHandler for CountingHandler {
    async fn transcript_facts(&self, _payload: Option<&JsonValue>) -> Result<RunReport> {
        self.transcripts.fetch_add(1, Ordering::SeqCst);
        Ok(RunReport::default())
    }

    async fn full_synthesis(&self) -> Result<RunReport> {
        self.full.fetch_add(1, Ordering::SeqCst);
        Ok(RunReport::default())
    }

    async fn project_tracker(&self) -> Result<RunReport> {
        self.tracker.fetch_add(1, Ordering::SeqCst);
        Ok(RunReport::default())
    }

    async fn regenerate_outputs(&self) -> Result<RunReport> {
        self.regen.fetch_add(1, Ordering::SeqCst);
        Ok(RunReport::default())
    }
}

fn fast_scheduler() -> SynthesisScheduler {
    SynthesisScheduler::new(SchedulerConfig {
        debounce_window_ms: 1_000,
        poll_interval_ms: 10,
        retention_minutes: 60,
    })
}

#[tokio::test(start_paused = true)]
async fn event_burst_coalesces_into_one_synthesis() {
    let scheduler = fast_scheduler();
    let handler = Arc::new(CountingHandler::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = scheduler.start(handler.clone(), shutdown_rx);

    // Five events inside one debounce window.
    for _ in 0..5 {
        scheduler.schedule_synthesis();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(handler.full.load(Ordering::SeqCst), 1);
    assert_eq!(handler.tracker.load(Ordering::SeqCst), 1);

    shutdown_tx.send(true).unwrap();
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn spaced_events_each_trigger_a_synthesis() {
    let scheduler = fast_scheduler();
    let handler = Arc::new(CountingHandler::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = scheduler.start(handler.clone(), shutdown_rx);

    scheduler.schedule_synthesis();
    tokio::time::sleep(Duration::from_secs(5)).await;
    scheduler.schedule_synthesis();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(handler.full.load(Ordering::SeqCst), 2);

    shutdown_tx.send(true).unwrap();
    for task in tasks {
        task.await.unwrap();
    }
}

// ── Watcher ────────────────────────────────────────────────────────────

#[tokio::test]
async fn watcher_detects_new_and_changed_files_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("standup.md");
    std::fs::write(&path, "first version").unwrap();

    let state = Arc::new(InMemoryWatchState::default());
    let scheduler = fast_scheduler();
    let watcher = TranscriptWatcher::new(
        WatcherConfig::new(dir.path()).with_poll_interval(1),
        state.clone(),
        scheduler.clone(),
    );

    assert_eq!(watcher.scan_once().await.unwrap(), 1);
    assert_eq!(scheduler.pending_count(), 1);

    // Unchanged content: nothing new.
    assert_eq!(watcher.scan_once().await.unwrap(), 0);
    assert_eq!(scheduler.pending_count(), 1);

    // Changed content: picked up again.
    std::fs::write(&path, "second version").unwrap();
    assert_eq!(watcher.scan_once().await.unwrap(), 1);
    assert_eq!(scheduler.pending_count(), 2);

    let entry = state
        .get(&path.to_string_lossy())
        .await
        .unwrap()
        .expect("entry recorded");
    assert!(entry.processed_at.is_none());
}

#[tokio::test]
async fn watcher_backlog_scan_enqueues_unprocessed_entries() {
    let state = Arc::new(InMemoryWatchState::default());
    state
        .upsert(&WatchEntry {
            path: "/transcripts/old.md".to_string(),
            checksum: "abc".to_string(),
            mtime: Utc::now(),
            processed_at: None,
        })
        .await
        .unwrap();
    state
        .upsert(&WatchEntry {
            path: "/transcripts/done.md".to_string(),
            checksum: "def".to_string(),
            mtime: Utc::now(),
            processed_at: Some(Utc::now()),
        })
        .await
        .unwrap();

    let scheduler = fast_scheduler();
    let watcher = TranscriptWatcher::new(
        WatcherConfig::new("/nonexistent"),
        state,
        scheduler.clone(),
    );

    assert_eq!(watcher.scan_backlog().await.unwrap(), 1);
    let pending = scheduler.snapshot();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].job_type, SynthesisJobType::TranscriptFacts);
    assert_eq!(pending[0].payload.as_ref().unwrap()["path"], "/transcripts/old.md");
}

// ── Synthesis handler dispatch ─────────────────────────────────────────

#[tokio::test]
async fn pipeline_handles_transcript_synthesis_job() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("meeting.md");
    std::fs::write(&path, "notes from the meeting").unwrap();

    let elements = Arc::new(InMemoryElements::default());
    let watch = Arc::new(InMemoryWatchState::default());
    let path_str = path.to_string_lossy().to_string();
    watch
        .upsert(&WatchEntry {
            path: path_str.clone(),
            checksum: "whatever".to_string(),
            mtime: Utc::now(),
            processed_at: None,
        })
        .await
        .unwrap();

    let pipeline = Pipeline::new(
        elements.clone(),
        Arc::new(MockReasoning::new()),
        Arc::new(InMemorySessions { sessions: vec![] }),
        watch.clone(),
    );

    let payload = serde_json::json!({ "path": path_str });
    let report = SynthesisHandler::transcript_facts(&pipeline, Some(&payload))
        .await
        .unwrap();
    assert_eq!(report.processed, 1);

    let root = ids::transcript_ref(&path_str);
    assert!(elements.has_elements_for_root(&root).await.unwrap());
    let entry = watch.get(&path_str).await.unwrap().unwrap();
    assert!(entry.processed_at.is_some());
}

#[tokio::test]
async fn transcript_job_without_path_is_invalid() {
    let (pipeline, _, _) = pipeline_with(vec![]);
    let err = SynthesisHandler::transcript_facts(&pipeline, None)
        .await
        .unwrap_err();
    assert!(matches!(err, stratum_core::Error::InvalidInput(_)));
}
