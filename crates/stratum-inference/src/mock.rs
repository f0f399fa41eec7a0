//! Deterministic in-memory reasoning backend for tests.
//!
//! Output depends only on the input (unit ref, element ids), so a
//! re-run over the same corpus produces identical content and the
//! derivation-key upsert path sees no changes. Supports per-operation
//! failure injection for error-path tests.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;

use stratum_core::{
    Error, ExtractedFact, InsightDraft, KnowledgeElement, ReasoningBackend, Result, ThemeCluster,
};

/// Scripted reasoning backend. Records every call so tests can assert
/// on which operations ran.
#[derive(Default)]
pub struct MockReasoning {
    calls: Mutex<Vec<String>>,
    fail_ops: Mutex<HashSet<String>>,
    /// Facts produced per unit. Stable across calls for idempotence tests.
    pub facts_per_unit: usize,
}

impl MockReasoning {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_ops: Mutex::new(HashSet::new()),
            facts_per_unit: 2,
        }
    }

    /// Make every subsequent call to `op` fail with [`Error::Reasoning`].
    pub fn fail_on(&self, op: &str) {
        self.fail_ops.lock().unwrap().insert(op.to_string());
    }

    /// Clear a failure injection set by [`fail_on`](Self::fail_on).
    pub fn recover(&self, op: &str) {
        self.fail_ops.lock().unwrap().remove(op);
    }

    /// Operations invoked so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == op).count()
    }

    fn record(&self, op: &str) -> Result<()> {
        self.calls.lock().unwrap().push(op.to_string());
        if self.fail_ops.lock().unwrap().contains(op) {
            return Err(Error::Reasoning(format!("mock failure injected for {op}")));
        }
        Ok(())
    }
}

#[async_trait]
impl ReasoningBackend for MockReasoning {
    async fn extract_facts(&self, unit_ref: &str, _text: &str) -> Result<Vec<ExtractedFact>> {
        self.record("extract_facts")?;
        Ok((0..self.facts_per_unit)
            .map(|n| ExtractedFact {
                content: json!({
                    "statement": format!("fact {n} from {unit_ref}"),
                    "subject": unit_ref,
                }),
                confidence: 0.9,
            })
            .collect())
    }

    async fn cluster_themes(&self, facts: &[KnowledgeElement]) -> Result<Vec<ThemeCluster>> {
        self.record("cluster_themes")?;
        if facts.is_empty() {
            return Ok(Vec::new());
        }
        let mut fact_ids: Vec<String> = facts.iter().map(|f| f.id.clone()).collect();
        fact_ids.sort();
        Ok(vec![ThemeCluster {
            label: "everything".to_string(),
            summary: format!("cluster of {} facts", fact_ids.len()),
            fact_ids,
            confidence: 0.8,
        }])
    }

    async fn synthesize_insights(
        &self,
        themes: &[KnowledgeElement],
        facts: &[KnowledgeElement],
    ) -> Result<Vec<InsightDraft>> {
        self.record("synthesize_insights")?;
        if themes.is_empty() {
            return Ok(Vec::new());
        }
        let mut theme_ids: Vec<String> = themes.iter().map(|t| t.id.clone()).collect();
        theme_ids.sort();
        let mut fact_ids: Vec<String> = facts.iter().map(|f| f.id.clone()).collect();
        fact_ids.sort();
        Ok(vec![InsightDraft {
            content: json!({
                "statement": format!("insight over {} themes", theme_ids.len()),
            }),
            theme_ids,
            fact_ids,
            disagreement: None,
            confidence: 0.7,
            source_count: facts.len().max(1) as i32,
        }])
    }

    async fn render_document(
        &self,
        profile: &str,
        insights: &[KnowledgeElement],
    ) -> Result<String> {
        self.record("render_document")?;
        let mut ids: Vec<&str> = insights.iter().map(|i| i.id.as_str()).collect();
        ids.sort();
        Ok(format!(
            "# {profile} dossier\n\nBuilt from {} insights: {}\n",
            ids.len(),
            ids.join(", ")
        ))
    }

    fn model_name(&self) -> &str {
        "mock-reasoning"
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use stratum_core::ElementKind;

    fn element(id: &str, kind: ElementKind) -> KnowledgeElement {
        KnowledgeElement {
            id: id.to_string(),
            kind,
            content: json!({}),
            confidence: 1.0,
            source_count: 1,
            derivation_key: format!("key_{id}"),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            superseded: false,
        }
    }

    #[tokio::test]
    async fn test_facts_are_deterministic() {
        let backend = MockReasoning::new();
        let a = backend.extract_facts("s_chat_sync_1", "hello").await.unwrap();
        let b = backend.extract_facts("s_chat_sync_1", "hello").await.unwrap();
        assert_eq!(a.len(), b.len());
        assert_eq!(a[0].content, b[0].content);
    }

    #[tokio::test]
    async fn test_failure_injection_and_recovery() {
        let backend = MockReasoning::new();
        backend.fail_on("cluster_themes");
        let facts = vec![element("f_1", ElementKind::Fact)];
        assert!(backend.cluster_themes(&facts).await.is_err());
        backend.recover("cluster_themes");
        assert!(backend.cluster_themes(&facts).await.is_ok());
        assert_eq!(backend.call_count("cluster_themes"), 2);
    }

    #[tokio::test]
    async fn test_empty_inputs_yield_empty_outputs() {
        let backend = MockReasoning::new();
        assert!(backend.cluster_themes(&[]).await.unwrap().is_empty());
        assert!(backend.synthesize_insights(&[], &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_theme_ids_sorted_for_stable_derivation() {
        let backend = MockReasoning::new();
        let themes = vec![element("t_b", ElementKind::Theme), element("t_a", ElementKind::Theme)];
        let drafts = backend.synthesize_insights(&themes, &[]).await.unwrap();
        assert_eq!(drafts[0].theme_ids, vec!["t_a", "t_b"]);
    }
}
