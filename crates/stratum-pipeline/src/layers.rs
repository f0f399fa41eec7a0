//! The four-layer distillation pipeline.
//!
//! L1 extracts Facts from raw units, L2 clusters Facts into Themes, L3
//! synthesizes Insights across Themes, L4 renders narrative Documents.
//! Every element is keyed by its derivation key, so re-running a layer
//! over unchanged upstream lineage creates zero new rows.

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, instrument, warn};

use stratum_core::{
    ids, ElementKind, ElementRepository, Error, KnowledgeElement, Layer, LineageEdge,
    PipelineOptions, ReasoningBackend, Result, RunReport, SessionProvider, WatchStateRepository,
};

use crate::enrich::persist_facts;

/// Dossier profiles rendered by a full L4 pass.
pub const DOSSIER_PROFILES: &[&str] = &["person", "organization"];

/// Profile refreshed by the dependent project-tracker synthesis job.
pub const PROJECT_TRACKER_PROFILE: &str = "project_tracker";

/// Owns the layer algorithms and their collaborators.
pub struct Pipeline {
    elements: Arc<dyn ElementRepository>,
    reasoning: Arc<dyn ReasoningBackend>,
    sessions: Arc<dyn SessionProvider>,
    watch: Arc<dyn WatchStateRepository>,
}

impl Pipeline {
    pub fn new(
        elements: Arc<dyn ElementRepository>,
        reasoning: Arc<dyn ReasoningBackend>,
        sessions: Arc<dyn SessionProvider>,
        watch: Arc<dyn WatchStateRepository>,
    ) -> Self {
        Self {
            elements,
            reasoning,
            sessions,
            watch,
        }
    }

    /// Full run: L1, then L2–L4 unless `facts_only`.
    #[instrument(skip(self, options), fields(subsystem = "pipeline", op = "run_full"))]
    pub async fn run_full(&self, options: &PipelineOptions) -> Result<RunReport> {
        let start = Instant::now();
        let mut report = self.layer_facts(options).await?;

        if !options.facts_only {
            report.absorb(self.layer_themes(options).await?);
            report.absorb(self.layer_insights(options).await?);
            report.absorb(self.layer_dossier(options, DOSSIER_PROFILES).await?);
        }

        info!(
            subsystem = "pipeline",
            op = "run_full",
            processed = report.processed,
            skipped = report.skipped,
            failed = report.failed,
            duration_ms = start.elapsed().as_millis() as u64,
            "Pipeline run finished"
        );
        Ok(report)
    }

    /// Run one named layer.
    pub async fn run_layer(&self, layer: Layer, options: &PipelineOptions) -> Result<RunReport> {
        match layer {
            Layer::Facts => self.layer_facts(options).await,
            Layer::Themes => self.layer_themes(options).await,
            Layer::Insights => self.layer_insights(options).await,
            Layer::Dossier => self.layer_dossier(options, DOSSIER_PROFILES).await,
        }
    }

    /// L2–L4 without re-extracting facts. Clusters the full fact set
    /// rather than only uncovered facts.
    #[instrument(skip(self, options), fields(subsystem = "pipeline", op = "regenerate"))]
    pub async fn regenerate(&self, options: &PipelineOptions) -> Result<RunReport> {
        let forced = PipelineOptions {
            force_reprocess: true,
            ..options.clone()
        };
        let mut report = self.layer_themes(&forced).await?;
        report.absorb(self.layer_insights(options).await?);
        report.absorb(self.layer_dossier(options, DOSSIER_PROFILES).await?);
        Ok(report)
    }

    /// Incremental dossier refresh: only acts when facts have arrived
    /// since the newest live document generation.
    #[instrument(skip(self, options), fields(subsystem = "pipeline", op = "run_curator"))]
    pub async fn run_curator(&self, options: &PipelineOptions) -> Result<RunReport> {
        let checkpoint = self
            .elements
            .list_kind(ElementKind::Document)
            .await?
            .into_iter()
            .map(|d| d.updated_at)
            .max();

        let fresh = match checkpoint {
            Some(cutoff) => self.elements.list_kind_since(ElementKind::Fact, cutoff).await?,
            // No document yet: everything is fresh.
            None => self.elements.list_kind(ElementKind::Fact).await?,
        };

        if fresh.is_empty() {
            info!(
                subsystem = "pipeline",
                op = "run_curator",
                "No new facts since last curation, nothing to do"
            );
            return Ok(RunReport {
                skipped: 1,
                ..RunReport::default()
            });
        }

        info!(
            subsystem = "pipeline",
            op = "run_curator",
            new_facts = fresh.len(),
            "Curating with new material"
        );
        let mut report = self.layer_themes(options).await?;
        report.absorb(self.layer_insights(options).await?);
        report.absorb(self.layer_dossier(options, DOSSIER_PROFILES).await?);
        Ok(report)
    }

    /// Extract facts from one watched transcript file and mark it
    /// processed.
    #[instrument(skip(self, options), fields(subsystem = "pipeline", op = "transcript_facts", path))]
    pub async fn transcript_facts(
        &self,
        path: &str,
        options: &PipelineOptions,
    ) -> Result<RunReport> {
        let unit_ref = ids::transcript_ref(path);
        if !options.force_reprocess && self.elements.has_elements_for_root(&unit_ref).await? {
            self.watch.mark_processed(path).await?;
            return Ok(RunReport {
                skipped: 1,
                ..RunReport::default()
            });
        }

        let content = tokio::fs::read_to_string(path).await?;
        if content.trim().is_empty() {
            warn!(
                subsystem = "pipeline",
                op = "transcript_facts",
                path,
                "Transcript is empty, skipping"
            );
            self.watch.mark_processed(path).await?;
            return Ok(RunReport {
                skipped: 1,
                ..RunReport::default()
            });
        }

        if options.dry_run {
            info!(
                subsystem = "pipeline",
                op = "transcript_facts",
                path,
                "Dry run: would extract facts"
            );
            return Ok(RunReport {
                processed: 1,
                ..RunReport::default()
            });
        }

        let facts = self.reasoning.extract_facts(&unit_ref, &content).await?;
        persist_facts(self.elements.as_ref(), &unit_ref, &facts).await?;
        self.watch.mark_processed(path).await?;
        Ok(RunReport {
            processed: 1,
            ..RunReport::default()
        })
    }

    // ── L1: facts ──────────────────────────────────────────────────────

    /// One reasoning call per unprocessed raw unit. Empty or missing
    /// content skips the unit; a reasoning failure fails the unit but
    /// never the run.
    async fn layer_facts(&self, options: &PipelineOptions) -> Result<RunReport> {
        let raw_units = self
            .sessions
            .list(options.since, options.limit, options.source)
            .await?;
        let mut report = RunReport::default();

        for raw in raw_units {
            let unit_ref = ids::session_ref(&raw.session_id, raw.source);

            if !options.force_reprocess && self.elements.has_elements_for_root(&unit_ref).await? {
                report.skipped += 1;
                continue;
            }
            if raw.content.trim().is_empty() {
                warn!(
                    subsystem = "pipeline",
                    layer = "facts",
                    session_id = %raw.session_id,
                    "Empty session content, skipping"
                );
                report.skipped += 1;
                continue;
            }
            if options.dry_run {
                info!(
                    subsystem = "pipeline",
                    layer = "facts",
                    session_id = %raw.session_id,
                    "Dry run: would extract facts"
                );
                report.processed += 1;
                continue;
            }

            match self.reasoning.extract_facts(&unit_ref, &raw.content).await {
                Ok(facts) => {
                    persist_facts(self.elements.as_ref(), &unit_ref, &facts).await?;
                    report.processed += 1;
                }
                Err(e) => {
                    warn!(
                        subsystem = "pipeline",
                        layer = "facts",
                        session_id = %raw.session_id,
                        error = %e,
                        "Fact extraction failed for unit"
                    );
                    report.failed += 1;
                }
            }
        }

        info!(
            subsystem = "pipeline",
            layer = "facts",
            processed = report.processed,
            skipped = report.skipped,
            failed = report.failed,
            "L1 complete"
        );
        Ok(report)
    }

    // ── L2: themes ─────────────────────────────────────────────────────

    /// Cluster facts not yet covered by any theme (all facts when
    /// forcing). Each theme must cite at least one fact.
    async fn layer_themes(&self, options: &PipelineOptions) -> Result<RunReport> {
        let mut facts = if options.force_reprocess {
            self.elements.list_kind(ElementKind::Fact).await?
        } else {
            self.elements.facts_without_theme().await?
        };
        if let Some(since) = options.since {
            facts.retain(|f| f.created_at >= since);
        }
        if let Some(limit) = options.limit {
            facts.truncate(limit);
        }

        let mut report = RunReport::default();
        if facts.is_empty() {
            info!(subsystem = "pipeline", layer = "themes", "No uncovered facts");
            return Ok(report);
        }
        if options.dry_run {
            info!(
                subsystem = "pipeline",
                layer = "themes",
                candidates = facts.len(),
                "Dry run: would cluster facts"
            );
            return Ok(report);
        }

        let clusters = self.reasoning.cluster_themes(&facts).await?;
        for cluster in clusters {
            if cluster.fact_ids.is_empty() {
                warn!(
                    subsystem = "pipeline",
                    layer = "themes",
                    label = %cluster.label,
                    "Theme cites no facts, dropping"
                );
                report.failed += 1;
                continue;
            }

            let key = ids::derivation_key(ElementKind::Theme, &cluster.fact_ids, &cluster.label);
            let id = ids::element_id(ElementKind::Theme, &key);
            let now = chrono::Utc::now();
            let element = KnowledgeElement {
                id: id.clone(),
                kind: ElementKind::Theme,
                content: serde_json::json!({
                    "label": cluster.label,
                    "summary": cluster.summary,
                }),
                confidence: cluster.confidence,
                source_count: cluster.fact_ids.len() as i32,
                derivation_key: key,
                created_at: now,
                updated_at: now,
                superseded: false,
            };
            let edges: Vec<LineageEdge> = cluster
                .fact_ids
                .iter()
                .map(|fact_id| LineageEdge {
                    child_id: id.clone(),
                    parent_ref: fact_id.clone(),
                    metadata: None,
                })
                .collect();

            if self.elements.upsert(element, &edges).await?.is_inserted() {
                report.processed += 1;
            } else {
                report.skipped += 1;
            }
        }

        info!(
            subsystem = "pipeline",
            layer = "themes",
            processed = report.processed,
            skipped = report.skipped,
            "L2 complete"
        );
        Ok(report)
    }

    // ── L3: insights ───────────────────────────────────────────────────

    /// Synthesize across the full theme set. Cross-source disagreement
    /// from the backend is preserved as lineage metadata, never
    /// resolved here.
    async fn layer_insights(&self, options: &PipelineOptions) -> Result<RunReport> {
        let mut themes = self.elements.list_kind(ElementKind::Theme).await?;
        if let Some(since) = options.since {
            themes.retain(|t| t.created_at >= since);
        }
        if let Some(limit) = options.limit {
            themes.truncate(limit);
        }
        let facts = self.elements.list_kind(ElementKind::Fact).await?;

        let mut report = RunReport::default();
        if themes.is_empty() {
            info!(subsystem = "pipeline", layer = "insights", "No themes yet");
            return Ok(report);
        }
        if options.dry_run {
            info!(
                subsystem = "pipeline",
                layer = "insights",
                themes = themes.len(),
                "Dry run: would synthesize insights"
            );
            return Ok(report);
        }

        let drafts = self.reasoning.synthesize_insights(&themes, &facts).await?;
        for draft in drafts {
            if draft.theme_ids.is_empty() {
                warn!(
                    subsystem = "pipeline",
                    layer = "insights",
                    "Insight cites no themes, dropping"
                );
                report.failed += 1;
                continue;
            }

            let mut parents = draft.theme_ids.clone();
            parents.extend(draft.fact_ids.iter().cloned());
            let key =
                ids::derivation_key(ElementKind::Insight, &parents, &draft.content.to_string());
            let id = ids::element_id(ElementKind::Insight, &key);
            let now = chrono::Utc::now();
            let element = KnowledgeElement {
                id: id.clone(),
                kind: ElementKind::Insight,
                content: draft.content.clone(),
                confidence: draft.confidence,
                source_count: draft.source_count,
                derivation_key: key,
                created_at: now,
                updated_at: now,
                superseded: false,
            };

            let mut edges: Vec<LineageEdge> = draft
                .theme_ids
                .iter()
                .map(|theme_id| LineageEdge {
                    child_id: id.clone(),
                    parent_ref: theme_id.clone(),
                    metadata: draft.disagreement.clone(),
                })
                .collect();
            edges.extend(draft.fact_ids.iter().map(|fact_id| LineageEdge {
                child_id: id.clone(),
                parent_ref: fact_id.clone(),
                metadata: None,
            }));

            if self.elements.upsert(element, &edges).await?.is_inserted() {
                report.processed += 1;
            } else {
                report.skipped += 1;
            }
        }

        info!(
            subsystem = "pipeline",
            layer = "insights",
            processed = report.processed,
            skipped = report.skipped,
            "L3 complete"
        );
        Ok(report)
    }

    // ── L4: dossier ────────────────────────────────────────────────────

    /// Render one document per profile from the current insight set.
    /// A new generation supersedes the previous one for that profile;
    /// an unchanged insight set renders into the same derivation key
    /// and leaves the current generation live.
    async fn layer_dossier(
        &self,
        options: &PipelineOptions,
        profiles: &[&str],
    ) -> Result<RunReport> {
        let mut insights = self.elements.list_kind(ElementKind::Insight).await?;
        if let Some(since) = options.since {
            insights.retain(|i| i.created_at >= since);
        }
        if let Some(limit) = options.limit {
            insights.truncate(limit);
        }

        let mut report = RunReport::default();
        if insights.is_empty() {
            info!(subsystem = "pipeline", layer = "dossier", "No insights yet");
            return Ok(report);
        }
        if options.dry_run {
            info!(
                subsystem = "pipeline",
                layer = "dossier",
                insights = insights.len(),
                profiles = profiles.len(),
                "Dry run: would render documents"
            );
            return Ok(report);
        }

        let insight_ids: Vec<String> = insights.iter().map(|i| i.id.clone()).collect();

        for profile in profiles {
            let body = match self.reasoning.render_document(profile, &insights).await {
                Ok(body) => body,
                Err(e) => {
                    warn!(
                        subsystem = "pipeline",
                        layer = "dossier",
                        profile,
                        error = %e,
                        "Document render failed"
                    );
                    report.failed += 1;
                    continue;
                }
            };
            if body.trim().is_empty() {
                return Err(Error::Reasoning(format!(
                    "empty document body for profile {profile}"
                )));
            }

            let key = ids::derivation_key(ElementKind::Document, &insight_ids, profile);
            let id = ids::element_id(ElementKind::Document, &key);
            let now = chrono::Utc::now();
            let element = KnowledgeElement {
                id: id.clone(),
                kind: ElementKind::Document,
                content: serde_json::json!({
                    "profile": profile,
                    "body": body,
                    "model": self.reasoning.model_name(),
                }),
                confidence: 1.0,
                source_count: insights.len() as i32,
                derivation_key: key,
                created_at: now,
                updated_at: now,
                superseded: false,
            };
            let edges: Vec<LineageEdge> = insight_ids
                .iter()
                .map(|insight_id| LineageEdge {
                    child_id: id.clone(),
                    parent_ref: insight_id.clone(),
                    metadata: None,
                })
                .collect();

            let outcome = self.elements.upsert(element, &edges).await?;
            if outcome.is_inserted() {
                let retired = self.elements.supersede_documents(&id, profile).await?;
                info!(
                    subsystem = "pipeline",
                    layer = "dossier",
                    profile,
                    element_id = %id,
                    retired,
                    "New document generation"
                );
                report.processed += 1;
            } else {
                report.skipped += 1;
            }
        }

        info!(
            subsystem = "pipeline",
            layer = "dossier",
            processed = report.processed,
            skipped = report.skipped,
            "L4 complete"
        );
        Ok(report)
    }

    /// L4 limited to the project-tracker profile, run as the dependent
    /// follow-up of a full synthesis.
    pub async fn project_tracker(&self, options: &PipelineOptions) -> Result<RunReport> {
        self.layer_dossier(options, &[PROJECT_TRACKER_PROFILE]).await
    }

    /// Re-render every dossier profile from the current insight set.
    pub async fn regenerate_outputs(&self, options: &PipelineOptions) -> Result<RunReport> {
        let mut profiles = DOSSIER_PROFILES.to_vec();
        profiles.push(PROJECT_TRACKER_PROFILE);
        self.layer_dossier(options, &profiles).await
    }
}

#[async_trait::async_trait]
impl crate::scheduler::SynthesisHandler for Pipeline {
    async fn transcript_facts(&self, payload: Option<&serde_json::Value>) -> Result<RunReport> {
        let path = payload
            .and_then(|p| p.get("path"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                Error::InvalidInput("transcript synthesis job carries no path".to_string())
            })?;
        Pipeline::transcript_facts(self, path, &PipelineOptions::default()).await
    }

    async fn full_synthesis(&self) -> Result<RunReport> {
        let options = PipelineOptions::default();
        let mut report = self.layer_themes(&options).await?;
        report.absorb(self.layer_insights(&options).await?);
        report.absorb(self.layer_dossier(&options, DOSSIER_PROFILES).await?);
        Ok(report)
    }

    async fn project_tracker(&self) -> Result<RunReport> {
        Pipeline::project_tracker(self, &PipelineOptions::default()).await
    }

    async fn regenerate_outputs(&self) -> Result<RunReport> {
        Pipeline::regenerate_outputs(self, &PipelineOptions::default()).await
    }
}
