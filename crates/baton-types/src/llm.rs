//! LLM request/response types for Baton.
//!
//! These model the data exchanged with LLM providers through the
//! `LlmProvider` contract: completion requests with tier-based model
//! selection, responses with optional usage/cost side-bands, and additively
//! composable token usage.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::ModelTier;

// ---------------------------------------------------------------------------
// Token usage
// ---------------------------------------------------------------------------

/// Token usage for a completion, additively composable up the step
/// hierarchy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
}

impl TokenUsage {
    /// Build a usage record from input/output counts; `total_tokens` is
    /// derived.
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
        }
    }

    /// Accumulate another usage record into this one.
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
    }

    /// Sum of two usage records.
    pub fn combined(&self, other: &TokenUsage) -> TokenUsage {
        let mut sum = *self;
        sum.add(other);
        sum
    }

    pub fn is_zero(&self) -> bool {
        self.total_tokens == 0 && self.cache_creation_tokens == 0 && self.cache_read_tokens == 0
    }
}

// ---------------------------------------------------------------------------
// Completion request / response
// ---------------------------------------------------------------------------

/// A tool descriptor made visible to an LLM call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
}

/// Request to an LLM provider for a completion.
///
/// `run_id`, `workflow_id`, and `step_name` are attribution fields the
/// provider passes through to its cost tracking; `extra` carries
/// provider-specific entries opaquely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default)]
    pub model: ModelTier,
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, Value>,
}

impl CompletionRequest {
    /// A minimal request with just a prompt, defaults elsewhere.
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            model: ModelTier::default(),
            tools: Vec::new(),
            run_id: None,
            workflow_id: None,
            step_name: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// Response from an LLM provider.
///
/// `usage` and `cost_usd` are optional: a provider that cannot report them
/// still produces a successful completion that contributes zero to
/// aggregated usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    /// The concrete model the provider selected for the requested tier.
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from LLM provider operations.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("provider error: {message}")]
    Provider { message: String },

    #[error("rate limited (retry after {retry_after_ms:?}ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_usage_new_derives_total() {
        let usage = TokenUsage::new(100, 40);
        assert_eq!(usage.total_tokens, 140);
        assert_eq!(usage.cache_creation_tokens, 0);
    }

    #[test]
    fn token_usage_addition_is_componentwise() {
        let mut a = TokenUsage::new(10, 5);
        let b = TokenUsage {
            input_tokens: 1,
            output_tokens: 2,
            total_tokens: 3,
            cache_creation_tokens: 4,
            cache_read_tokens: 5,
        };
        a.add(&b);
        assert_eq!(a.input_tokens, 11);
        assert_eq!(a.output_tokens, 7);
        assert_eq!(a.total_tokens, 18);
        assert_eq!(a.cache_creation_tokens, 4);
        assert_eq!(a.cache_read_tokens, 5);
    }

    #[test]
    fn token_usage_total_invariant_preserved_under_combination() {
        let a = TokenUsage::new(7, 3);
        let b = TokenUsage::new(13, 17);
        let sum = a.combined(&b);
        assert_eq!(sum.total_tokens, sum.input_tokens + sum.output_tokens);
    }

    #[test]
    fn token_usage_is_zero() {
        assert!(TokenUsage::default().is_zero());
        assert!(!TokenUsage::new(0, 1).is_zero());
    }

    #[test]
    fn completion_request_from_prompt_defaults() {
        let req = CompletionRequest::from_prompt("hello");
        assert_eq!(req.prompt, "hello");
        assert_eq!(req.model, ModelTier::Balanced);
        assert!(req.tools.is_empty());
        assert!(req.run_id.is_none());
    }

    #[test]
    fn completion_response_without_usage_deserializes() {
        let json = r#"{"content":"ok","model":"fast-1"}"#;
        let resp: CompletionResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.content, "ok");
        assert!(resp.usage.is_none());
        assert!(resp.cost_usd.is_none());
    }

    #[test]
    fn llm_error_display() {
        let err = LlmError::Provider {
            message: "upstream 500".to_string(),
        };
        assert!(err.to_string().contains("upstream 500"));
    }
}
