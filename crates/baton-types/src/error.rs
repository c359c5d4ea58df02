//! Structured error records surfaced to external consumers.
//!
//! These carry enough machine-readable detail for callers to react
//! programmatically; the engine's module-level error enums wrap them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::cost::UsageSnapshot;
use crate::workflow::WorkflowLimits;

/// Maximum length of the raw LLM response embedded in a schema violation.
pub const MAX_SCHEMA_RESPONSE_CHARS: usize = 500;

/// A definition-level or input-level validation failure. Fatal; aborts the
/// run before execution.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("validation error on '{field}': {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// A required collaborator or configuration key is missing.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("configuration error for '{key}': {reason}")]
pub struct ConfigError {
    pub key: String,
    pub reason: String,
}

impl ConfigError {
    pub fn new(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Structured-output validation exhausted its retries.
///
/// `actual_response` is truncated to [`MAX_SCHEMA_RESPONSE_CHARS`];
/// `validation_errors` collects the messages from every failed attempt.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("structured output failed schema validation after {attempts} attempts: {}", validation_errors.join("; "))]
pub struct SchemaViolation {
    pub error_code: String,
    pub expected_schema: Value,
    pub actual_response: String,
    pub validation_errors: Vec<String>,
    pub attempts: u32,
}

impl SchemaViolation {
    pub const ERROR_CODE: &'static str = "SCHEMA_VALIDATION_FAILED";

    pub fn new(
        expected_schema: Value,
        actual_response: &str,
        validation_errors: Vec<String>,
        attempts: u32,
    ) -> Self {
        let truncated: String = actual_response
            .chars()
            .take(MAX_SCHEMA_RESPONSE_CHARS)
            .collect();
        Self {
            error_code: Self::ERROR_CODE.to_string(),
            expected_schema,
            actual_response: truncated,
            validation_errors,
            attempts,
        }
    }
}

/// A workflow- or step-level cost ceiling was exceeded with
/// `on_limit: abort`.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("cost limit exceeded ({scope}): {reason}")]
pub struct CostLimitExceeded {
    /// `"workflow"` or `"step <id>"`.
    pub scope: String,
    /// Which limit(s) were exceeded and by how much.
    pub reason: String,
    pub current_usage: UsageSnapshot,
    pub limits: WorkflowLimits,
}

/// A workflow- or step-level token ceiling was exceeded.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("token limit exceeded ({scope}): {actual} tokens over limit {limit}")]
pub struct TokenLimitExceeded {
    pub scope: String,
    pub limit: u64,
    pub actual: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validation_error_display() {
        let err = ValidationError::new("steps[2].id", "duplicate step ID 'gather'")
            .with_suggestion("rename one of the steps");
        assert!(err.to_string().contains("steps[2].id"));
        assert!(err.to_string().contains("duplicate"));
        assert_eq!(err.suggestion.as_deref(), Some("rename one of the steps"));
    }

    #[test]
    fn config_error_display() {
        let err = ConfigError::new("llm_provider", "no provider configured");
        assert_eq!(
            err.to_string(),
            "configuration error for 'llm_provider': no provider configured"
        );
    }

    #[test]
    fn schema_violation_truncates_response() {
        let long = "x".repeat(MAX_SCHEMA_RESPONSE_CHARS + 100);
        let violation = SchemaViolation::new(
            json!({"type": "object"}),
            &long,
            vec!["missing required field 'name'".to_string()],
            3,
        );
        assert_eq!(violation.actual_response.len(), MAX_SCHEMA_RESPONSE_CHARS);
        assert_eq!(violation.error_code, SchemaViolation::ERROR_CODE);
        assert_eq!(violation.attempts, 3);
        assert!(violation.to_string().contains("3 attempts"));
    }

    #[test]
    fn cost_limit_exceeded_display() {
        let err = CostLimitExceeded {
            scope: "workflow".to_string(),
            reason: "cost $0.0600 exceeds limit $0.0500".to_string(),
            current_usage: UsageSnapshot::default(),
            limits: WorkflowLimits::default(),
        };
        assert!(err.to_string().contains("workflow"));
        assert!(err.to_string().contains("$0.0600"));
    }

    #[test]
    fn token_limit_exceeded_display() {
        let err = TokenLimitExceeded {
            scope: "step gather".to_string(),
            limit: 1000,
            actual: 1500,
        };
        assert!(err.to_string().contains("step gather"));
        assert!(err.to_string().contains("1500"));
    }
}
