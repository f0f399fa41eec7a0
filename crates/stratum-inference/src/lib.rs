//! Reasoning backends for the synthesis pipeline.
//!
//! One production backend speaking the OpenAI chat-completions dialect
//! (local Ollama by default) and a deterministic mock for tests.

pub mod config;
pub mod mock;
pub mod openai;

pub use config::ReasoningConfig;
pub use mock::MockReasoning;
pub use openai::OpenAiReasoning;
