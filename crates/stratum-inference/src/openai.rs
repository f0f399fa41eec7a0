//! OpenAI-compatible chat-completions reasoning backend.
//!
//! Works against any endpoint exposing `/chat/completions` (Ollama,
//! vLLM, OpenAI). Each trait method wraps one prompt template, asks for
//! JSON-only output, and parses the structured reply. Transport and
//! parse failures surface as [`Error::Reasoning`] / [`Error::Request`],
//! which the job layer treats as transient.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, instrument, warn};

use stratum_core::{
    Error, ExtractedFact, InsightDraft, KnowledgeElement, ReasoningBackend, Result, ThemeCluster,
};

use crate::config::ReasoningConfig;

const FACTS_SYSTEM: &str = "You distill conversations into atomic facts. \
Reply with a JSON array only; each item has \"statement\" (string), \
\"subject\" (string), and \"confidence\" (0..1).";

const THEMES_SYSTEM: &str = "You cluster facts into themes. Reply with a JSON \
array only; each item has \"label\", \"summary\", \"fact_ids\" (non-empty \
array of the given fact ids), and \"confidence\" (0..1).";

const INSIGHTS_SYSTEM: &str = "You synthesize cross-theme insights. Reply with \
a JSON array only; each item has \"statement\", \"theme_ids\" (non-empty), \
\"fact_ids\" (may be empty), \"disagreement\" (object or null, preserving any \
cross-source conflict verbatim), \"confidence\" (0..1), and \"source_count\" \
(integer).";

const DOCUMENT_SYSTEM: &str = "You write narrative dossier documents in \
Markdown from a set of insights. Reply with the document body only.";

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// Reasoning backend over an OpenAI-compatible HTTP endpoint.
pub struct OpenAiReasoning {
    client: reqwest::Client,
    config: ReasoningConfig,
}

impl OpenAiReasoning {
    pub fn new(config: ReasoningConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Request(e.to_string()))?;
        Ok(Self { client, config })
    }

    #[instrument(skip(self, system, user), fields(model = %self.config.model))]
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let start = Instant::now();
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: 0.1,
        };

        let url = format!("{}/chat/completions", self.config.base_url);
        let mut req = self.client.post(&url).json(&request);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }

        let response = req
            .send()
            .await
            .map_err(|e| Error::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Reasoning(format!(
                "reasoning endpoint returned {}",
                response.status()
            )));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::Request(e.to_string()))?;

        let content = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::Reasoning("empty choices in reasoning reply".to_string()))?;

        debug!(
            subsystem = "inference",
            component = "openai",
            op = "chat",
            duration_ms = start.elapsed().as_millis() as u64,
            response_len = content.len(),
            "Reasoning call completed"
        );
        Ok(content)
    }
}

/// Parse a JSON array out of a model reply, tolerating Markdown code
/// fences around the payload.
pub(crate) fn parse_json_array(reply: &str) -> Result<Vec<JsonValue>> {
    let trimmed = reply.trim();
    let stripped = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.strip_suffix("```").unwrap_or(s))
        .unwrap_or(trimmed)
        .trim();

    match serde_json::from_str::<JsonValue>(stripped) {
        Ok(JsonValue::Array(items)) => Ok(items),
        Ok(other) => Err(Error::Reasoning(format!(
            "expected JSON array, got {}",
            match other {
                JsonValue::Object(_) => "object",
                JsonValue::String(_) => "string",
                _ => "scalar",
            }
        ))),
        Err(e) => Err(Error::Reasoning(format!("unparseable reasoning reply: {e}"))),
    }
}

fn str_field(item: &JsonValue, field: &str) -> Option<String> {
    item.get(field).and_then(|v| v.as_str()).map(String::from)
}

fn str_list_field(item: &JsonValue, field: &str) -> Vec<String> {
    item.get(field)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

fn confidence_field(item: &JsonValue) -> f64 {
    item.get("confidence")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.5)
        .clamp(0.0, 1.0)
}

#[async_trait]
impl ReasoningBackend for OpenAiReasoning {
    async fn extract_facts(&self, unit_ref: &str, text: &str) -> Result<Vec<ExtractedFact>> {
        let prompt = format!("Source unit: {unit_ref}\n\nConversation:\n{text}");
        let reply = self.chat(FACTS_SYSTEM, &prompt).await?;

        let mut facts = Vec::new();
        for item in parse_json_array(&reply)? {
            if item.get("statement").and_then(|v| v.as_str()).is_none() {
                warn!(
                    subsystem = "inference",
                    component = "openai",
                    "Dropping fact without statement field"
                );
                continue;
            }
            facts.push(ExtractedFact {
                confidence: confidence_field(&item),
                content: item,
            });
        }
        Ok(facts)
    }

    async fn cluster_themes(&self, facts: &[KnowledgeElement]) -> Result<Vec<ThemeCluster>> {
        let listing: Vec<JsonValue> = facts
            .iter()
            .map(|f| serde_json::json!({ "id": f.id, "content": f.content }))
            .collect();
        let prompt = format!("Facts:\n{}", serde_json::to_string_pretty(&listing)?);
        let reply = self.chat(THEMES_SYSTEM, &prompt).await?;

        let mut clusters = Vec::new();
        for item in parse_json_array(&reply)? {
            let fact_ids = str_list_field(&item, "fact_ids");
            if fact_ids.is_empty() {
                // Invariant: a theme must reference at least one fact.
                warn!(
                    subsystem = "inference",
                    component = "openai",
                    "Dropping theme with no fact references"
                );
                continue;
            }
            clusters.push(ThemeCluster {
                label: str_field(&item, "label").unwrap_or_else(|| "untitled".to_string()),
                summary: str_field(&item, "summary").unwrap_or_default(),
                fact_ids,
                confidence: confidence_field(&item),
            });
        }
        Ok(clusters)
    }

    async fn synthesize_insights(
        &self,
        themes: &[KnowledgeElement],
        facts: &[KnowledgeElement],
    ) -> Result<Vec<InsightDraft>> {
        let theme_listing: Vec<JsonValue> = themes
            .iter()
            .map(|t| serde_json::json!({ "id": t.id, "content": t.content }))
            .collect();
        let fact_listing: Vec<JsonValue> = facts
            .iter()
            .map(|f| serde_json::json!({ "id": f.id, "content": f.content }))
            .collect();
        let prompt = format!(
            "Themes:\n{}\n\nFacts:\n{}",
            serde_json::to_string_pretty(&theme_listing)?,
            serde_json::to_string_pretty(&fact_listing)?
        );
        let reply = self.chat(INSIGHTS_SYSTEM, &prompt).await?;

        let mut drafts = Vec::new();
        for item in parse_json_array(&reply)? {
            let theme_ids = str_list_field(&item, "theme_ids");
            if theme_ids.is_empty() {
                warn!(
                    subsystem = "inference",
                    component = "openai",
                    "Dropping insight with no theme references"
                );
                continue;
            }
            let disagreement = item
                .get("disagreement")
                .filter(|v| !v.is_null())
                .cloned();
            let source_count = item
                .get("source_count")
                .and_then(|v| v.as_i64())
                .unwrap_or(1) as i32;
            drafts.push(InsightDraft {
                confidence: confidence_field(&item),
                fact_ids: str_list_field(&item, "fact_ids"),
                theme_ids,
                disagreement,
                source_count,
                content: item,
            });
        }
        Ok(drafts)
    }

    async fn render_document(
        &self,
        profile: &str,
        insights: &[KnowledgeElement],
    ) -> Result<String> {
        let listing: Vec<JsonValue> = insights
            .iter()
            .map(|i| serde_json::json!({ "id": i.id, "content": i.content }))
            .collect();
        let prompt = format!(
            "Profile: {profile}\n\nInsights:\n{}",
            serde_json::to_string_pretty(&listing)?
        );
        self.chat(DOCUMENT_SYSTEM, &prompt).await
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/models", self.config.base_url);
        let mut req = self.client.get(&url);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }
        match req.send().await {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_array_plain() {
        let items = parse_json_array(r#"[{"statement": "a"}, {"statement": "b"}]"#).unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn test_parse_json_array_fenced() {
        let reply = "```json\n[{\"statement\": \"a\"}]\n```";
        let items = parse_json_array(reply).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["statement"], "a");
    }

    #[test]
    fn test_parse_json_array_rejects_object() {
        let err = parse_json_array(r#"{"statement": "a"}"#).unwrap_err();
        assert!(matches!(err, Error::Reasoning(_)));
    }

    #[test]
    fn test_parse_json_array_rejects_garbage() {
        assert!(parse_json_array("I could not comply").is_err());
    }

    #[test]
    fn test_confidence_field_clamps() {
        let item = serde_json::json!({"confidence": 3.5});
        assert_eq!(confidence_field(&item), 1.0);
        let item = serde_json::json!({"confidence": -1.0});
        assert_eq!(confidence_field(&item), 0.0);
        let item = serde_json::json!({});
        assert_eq!(confidence_field(&item), 0.5);
    }

    #[test]
    fn test_str_list_field_missing() {
        let item = serde_json::json!({});
        assert!(str_list_field(&item, "fact_ids").is_empty());
    }
}
