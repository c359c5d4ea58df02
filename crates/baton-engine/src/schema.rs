//! Structured-output pipeline for LLM steps declaring an `output_schema`.
//!
//! The pipeline augments the prompt with a schema description, extracts
//! the first JSON object or array from the response (tolerating fenced
//! blocks and surrounding prose), validates it against the schema, and
//! retries with a clarifying prefix up to [`MAX_SCHEMA_ATTEMPTS`] times.
//!
//! Usage and cost accumulate across **all** attempts, including failed
//! ones, so a step that exhausts its retries still bills correctly.

use serde_json::Value;

use baton_types::error::SchemaViolation;
use baton_types::llm::{CompletionRequest, LlmError, TokenUsage};

use crate::llm::BoxLlmProvider;
use crate::pricing;

/// Fixed cap on extraction/validation attempts.
pub const MAX_SCHEMA_ATTEMPTS: u32 = 3;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// A schema-validated completion.
#[derive(Debug, Clone)]
pub struct StructuredCompletion {
    /// The parsed, schema-conforming value.
    pub output: Value,
    /// The raw text of the accepted response.
    pub raw_response: String,
    /// Attempts performed (1-based).
    pub attempts: u32,
    /// Usage summed across every attempt.
    pub usage: TokenUsage,
    /// Cost summed across every attempt.
    pub cost_usd: f64,
    /// Model reported by the accepted response.
    pub model: String,
}

/// Structured completion failure, still carrying the usage/cost of the
/// attempts that were made.
#[derive(Debug, thiserror::Error)]
pub enum StructuredError {
    #[error(transparent)]
    Schema(Box<SchemaFailure>),

    #[error("llm error during structured completion: {source}")]
    Provider {
        source: LlmError,
        usage: TokenUsage,
        cost_usd: f64,
    },
}

/// Exhausted retries: the violation record plus billed usage.
#[derive(Debug, thiserror::Error)]
#[error("{violation}")]
pub struct SchemaFailure {
    pub violation: SchemaViolation,
    pub usage: TokenUsage,
    pub cost_usd: f64,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Run the structured-output pipeline against a provider.
pub async fn complete_structured(
    provider: &BoxLlmProvider,
    request: &CompletionRequest,
    schema: &Value,
) -> Result<StructuredCompletion, StructuredError> {
    let mut usage = TokenUsage::default();
    let mut cost_usd = 0.0;
    let mut validation_errors: Vec<String> = Vec::new();
    let mut last_response = String::new();

    for attempt in 1..=MAX_SCHEMA_ATTEMPTS {
        let prompt = if attempt == 1 {
            augment_prompt(&request.prompt, schema)
        } else {
            clarified_prompt(&request.prompt, schema, &validation_errors)
        };
        let mut attempt_request = request.clone();
        attempt_request.prompt = prompt;

        let response = match provider.complete(&attempt_request).await {
            Ok(response) => response,
            Err(source) => {
                return Err(StructuredError::Provider {
                    source,
                    usage,
                    cost_usd,
                });
            }
        };

        if let Some(attempt_usage) = &response.usage {
            usage.add(attempt_usage);
            cost_usd += response
                .cost_usd
                .unwrap_or_else(|| pricing::estimate_cost(attempt_usage, request.model));
        }
        last_response = response.content.clone();

        match extract_json(&response.content) {
            None => {
                validation_errors.push(format!(
                    "attempt {attempt}: no JSON object or array found in response"
                ));
            }
            Some(parsed) => {
                let errors = validate_value(&parsed, schema, "$");
                if errors.is_empty() {
                    return Ok(StructuredCompletion {
                        output: parsed,
                        raw_response: response.content,
                        attempts: attempt,
                        usage,
                        cost_usd,
                        model: response.model,
                    });
                }
                for error in errors {
                    validation_errors.push(format!("attempt {attempt}: {error}"));
                }
            }
        }
        tracing::debug!(attempt, "structured output attempt failed validation");
    }

    Err(StructuredError::Schema(Box::new(SchemaFailure {
        violation: SchemaViolation::new(
            schema.clone(),
            &last_response,
            validation_errors,
            MAX_SCHEMA_ATTEMPTS,
        ),
        usage,
        cost_usd,
    })))
}

/// Append the schema description to the user prompt.
pub fn augment_prompt(prompt: &str, schema: &Value) -> String {
    let rendered = serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
    format!(
        "{prompt}\n\nRespond with a single JSON value matching this schema:\n```json\n{rendered}\n```\nReturn only the JSON."
    )
}

/// Prefix the augmented prompt with the previous attempts' failures.
fn clarified_prompt(prompt: &str, schema: &Value, errors: &[String]) -> String {
    let recent = errors.last().map(String::as_str).unwrap_or("invalid JSON");
    format!(
        "Your previous response did not satisfy the required schema ({recent}). \
         Respond again, correcting the problem.\n\n{}",
        augment_prompt(prompt, schema)
    )
}

// ---------------------------------------------------------------------------
// JSON extraction
// ---------------------------------------------------------------------------

/// Extract the first JSON object or array from free-form text.
///
/// Preference order: a ``` fenced block, then the first balanced
/// `{...}`/`[...]` span in the raw text.
pub fn extract_json(text: &str) -> Option<Value> {
    if let Some(inner) = fenced_block(text) {
        if let Some(value) = parse_json_span(inner) {
            return Some(value);
        }
    }
    parse_json_span(text)
}

/// The contents of the first ``` fence, tolerating a language tag.
fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_open = &text[open + 3..];
    let body_start = after_open.find('\n')? + 1;
    let body = &after_open[body_start..];
    let close = body.find("```")?;
    Some(&body[..close])
}

/// Parse the first balanced object/array span found in the text.
fn parse_json_span(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let start = text.find(['{', '['])?;
    let open = bytes[start];
    let close = if open == b'{' { b'}' } else { b']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b if b == open => depth += 1,
            b if b == close => {
                depth -= 1;
                if depth == 0 {
                    let span = &text[start..start + offset + 1];
                    return serde_json::from_str::<Value>(span)
                        .ok()
                        .filter(|value| value.is_object() || value.is_array());
                }
            }
            _ => {}
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Schema validation
// ---------------------------------------------------------------------------

/// Validate a value against a JSON-Schema-like map.
///
/// Supported keywords: `type` (string, number, integer, boolean, array,
/// object), `required`, `enum`, `properties`, `items`. Extra fields in the
/// value are allowed. Returns all violations found.
pub fn validate_value(value: &Value, schema: &Value, path: &str) -> Vec<String> {
    let mut errors = Vec::new();

    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        if !type_matches(value, expected) {
            errors.push(format!(
                "{path}: expected {expected}, got {}",
                type_name(value)
            ));
            return errors;
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            errors.push(format!(
                "{path}: value {value} is not one of the allowed values"
            ));
        }
    }

    if let Value::Object(map) = value {
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for name in required.iter().filter_map(Value::as_str) {
                if !map.contains_key(name) {
                    errors.push(format!("{path}: missing required field '{name}'"));
                }
            }
        }
        if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
            for (name, property_schema) in properties {
                if let Some(property) = map.get(name) {
                    errors.extend(validate_value(
                        property,
                        property_schema,
                        &format!("{path}.{name}"),
                    ));
                }
            }
        }
    }

    if let (Value::Array(items), Some(item_schema)) = (value, schema.get("items")) {
        for (index, item) in items.iter().enumerate() {
            errors.extend(validate_value(
                item,
                item_schema,
                &format!("{path}[{index}]"),
            ));
        }
    }

    errors
}

fn type_matches(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
