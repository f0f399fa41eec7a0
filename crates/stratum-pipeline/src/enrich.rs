//! Per-session fact extraction.
//!
//! The worker pool hands this one exact `(session_id, source)` at a
//! time. Content problems (connector lost the session, empty text) are
//! skips, not failures: retrying would skip again. Transport and
//! reasoning errors propagate so the queue records a retryable failure.

use std::sync::Arc;

use tracing::{debug, info};

use stratum_core::{
    ids, ElementKind, ElementRepository, EnrichOutcome, ExtractedFact, JobSource,
    KnowledgeElement, LineageEdge, ReasoningBackend, Result, SessionEnricher, SessionProvider,
};

/// Persist extracted facts under a raw-unit ref. Returns the number of
/// newly inserted elements (re-extractions upsert in place).
pub(crate) async fn persist_facts(
    elements: &dyn ElementRepository,
    unit_ref: &str,
    facts: &[ExtractedFact],
) -> Result<usize> {
    let parents = vec![unit_ref.to_string()];
    let mut inserted = 0;

    for fact in facts {
        let discriminator = fact.content.to_string();
        let key = ids::derivation_key(ElementKind::Fact, &parents, &discriminator);
        let id = ids::element_id(ElementKind::Fact, &key);
        let now = chrono::Utc::now();

        let element = KnowledgeElement {
            id: id.clone(),
            kind: ElementKind::Fact,
            content: fact.content.clone(),
            confidence: fact.confidence,
            source_count: 1,
            derivation_key: key,
            created_at: now,
            updated_at: now,
            superseded: false,
        };
        let edges = vec![LineageEdge {
            child_id: id,
            parent_ref: unit_ref.to_string(),
            metadata: None,
        }];

        if elements.upsert(element, &edges).await?.is_inserted() {
            inserted += 1;
        }
    }

    debug!(
        subsystem = "pipeline",
        component = "enrich",
        element_id = unit_ref,
        extracted = facts.len(),
        inserted,
        "Persisted facts"
    );
    Ok(inserted)
}

/// Default [`SessionEnricher`]: fetch the raw session from its
/// connector, run fact extraction, persist with lineage to the
/// session's root ref.
pub struct Enricher {
    sessions: Arc<dyn SessionProvider>,
    reasoning: Arc<dyn ReasoningBackend>,
    elements: Arc<dyn ElementRepository>,
}

impl Enricher {
    pub fn new(
        sessions: Arc<dyn SessionProvider>,
        reasoning: Arc<dyn ReasoningBackend>,
        elements: Arc<dyn ElementRepository>,
    ) -> Self {
        Self {
            sessions,
            reasoning,
            elements,
        }
    }
}

#[async_trait::async_trait]
impl SessionEnricher for Enricher {
    async fn enrich(&self, session_id: &str, source: JobSource) -> Result<EnrichOutcome> {
        let Some(raw) = self.sessions.fetch(session_id, source).await? else {
            return Ok(EnrichOutcome::Skipped {
                reason: "session no longer available from connector".to_string(),
            });
        };

        if raw.content.trim().is_empty() {
            return Ok(EnrichOutcome::Skipped {
                reason: "empty content".to_string(),
            });
        }

        let unit_ref = ids::session_ref(session_id, source);
        let facts = self.reasoning.extract_facts(&unit_ref, &raw.content).await?;
        if facts.is_empty() {
            return Ok(EnrichOutcome::Skipped {
                reason: "no extractable facts".to_string(),
            });
        }

        let inserted = persist_facts(self.elements.as_ref(), &unit_ref, &facts).await?;
        info!(
            subsystem = "pipeline",
            component = "enrich",
            session_id,
            source = source.as_str(),
            facts = facts.len(),
            inserted,
            model = self.reasoning.model_name(),
            "Session enriched"
        );
        Ok(EnrichOutcome::Enriched { facts: facts.len() })
    }
}
