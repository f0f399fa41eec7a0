//! Reasoning backend configuration from environment variables.

use stratum_core::{Error, Result};

/// Default chat-completions endpoint (OpenAI-compatible local server).
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434/v1";

/// Default model identifier.
pub const DEFAULT_MODEL: &str = "qwen2.5:14b";

/// Default per-request timeout. Synthesis prompts carry large aggregated
/// context, so this is generous.
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Configuration for the HTTP reasoning backend.
///
/// | Variable | Default | Description |
/// |----------|---------|-------------|
/// | `REASONING_BASE_URL` | `http://localhost:11434/v1` | OpenAI-compatible endpoint |
/// | `REASONING_MODEL` | `qwen2.5:14b` | Model identifier |
/// | `REASONING_API_KEY` | *(none)* | Bearer token, if the endpoint needs one |
/// | `REASONING_TIMEOUT_SECS` | `120` | Per-request timeout |
#[derive(Debug, Clone)]
pub struct ReasoningConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl ReasoningConfig {
    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("REASONING_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        if base_url.is_empty() {
            return Err(Error::Config("REASONING_BASE_URL is empty".to_string()));
        }

        let model =
            std::env::var("REASONING_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let api_key = std::env::var("REASONING_API_KEY").ok().filter(|k| !k.is_empty());

        let timeout_secs = match std::env::var("REASONING_TIMEOUT_SECS") {
            Ok(v) => v
                .parse::<u64>()
                .map_err(|_| Error::Config(format!("invalid REASONING_TIMEOUT_SECS: {v}")))?,
            Err(_) => DEFAULT_TIMEOUT_SECS,
        };

        Ok(Self {
            base_url,
            model,
            api_key,
            timeout_secs,
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}
