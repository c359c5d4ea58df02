//! Workflow domain types for Baton.
//!
//! Defines the canonical intermediate representation for workflows: YAML
//! documents and programmatic construction both produce a
//! `WorkflowDefinition`. This module also contains the execution result
//! envelope (`StepResult`) and the limit configuration consumed by the
//! cost enforcer.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::TokenUsage;

// ---------------------------------------------------------------------------
// Workflow Definition (canonical IR)
// ---------------------------------------------------------------------------

/// The canonical workflow definition.
///
/// Immutable after validation; the engine never mutates a definition at
/// run time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared inputs, reconciled against caller-supplied arguments.
    #[serde(default)]
    pub inputs: Vec<InputDecl>,
    /// Agents referenced by `agent` steps, keyed by name.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub agents: HashMap<String, AgentDefinition>,
    /// Ordered list of step definitions.
    pub steps: Vec<StepDefinition>,
    /// Declared outputs, extracted after the last step completes.
    #[serde(default)]
    pub outputs: Vec<OutputDecl>,
    /// Workflow-level cost/token ceilings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<WorkflowLimits>,
}

/// A declared workflow input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputDecl {
    /// Input name, referenced in templates as `{{.inputs.<name>}}`.
    pub name: String,
    /// Expected value type.
    #[serde(rename = "type", default)]
    pub input_type: InputType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Default value used when the caller supplies nothing. An input with
    /// no default is required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Allowed values (enum constraint).
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
    /// Regex-like pattern constraint for string inputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

/// Value type of a declared input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    #[default]
    String,
    Number,
    Boolean,
    Array,
    Object,
}

/// A declared workflow output.
///
/// `value` is a template expression evaluated against the final workflow
/// context (e.g. `"{{.steps.summarize.response}}"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputDecl {
    pub name: String,
    pub value: String,
}

/// An agent referenced by `agent` steps: a reusable LLM persona with a
/// system prompt, model tier, and tool allowlist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelTier>,
    #[serde(default)]
    pub tools: Vec<String>,
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step in a workflow.
///
/// Common attributes live on the struct; type-specific attributes live in
/// the flattened [`StepConfig`] variant selected by the `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// User-defined step ID. Unique within its containing step list.
    pub id: String,
    /// Gate (or, for condition steps, branch) expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionSpec>,
    /// Step-level timeout in seconds. `None` (and, for loops, `0`) means
    /// inherit the type default or the surrounding deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Retry configuration for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// What to do when the handler fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<ErrorPolicy>,
    /// Step-level token ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    /// Step-level cost ceiling in USD.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
    /// Security permission patterns for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Permissions>,
    /// Type-specific configuration payload.
    #[serde(flatten)]
    pub config: StepConfig,
}

/// Condition wrapper holding the expression string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionSpec {
    pub expression: String,
}

/// Step-specific configuration, internally tagged by `type` to match the
/// document structure:
///
/// ```yaml
/// - id: review
///   type: llm
///   prompt: "Review: {{.inputs.diff}}"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    /// Single LLM completion, optionally schema-constrained.
    Llm {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        system: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<ModelTier>,
        #[serde(default)]
        tools: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_schema: Option<Value>,
    },
    /// LLM completion through a named agent definition.
    Agent {
        agent: String,
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_schema: Option<Value>,
    },
    /// Call into the operation registry, either as
    /// `integration: "name.operation"` or as `action` + `operation`.
    Integration {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        integration: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        action: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operation: Option<String>,
        #[serde(default)]
        inputs: serde_json::Map<String, Value>,
    },
    /// If/else branching. The branch expression is the step's `condition`.
    Condition {
        #[serde(default)]
        then_steps: Vec<StepDefinition>,
        #[serde(default)]
        else_steps: Vec<StepDefinition>,
    },
    /// Concurrent fan-out over nested steps, or over an array when
    /// `foreach` is set.
    Parallel {
        steps: Vec<StepDefinition>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_concurrency: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        foreach: Option<String>,
    },
    /// Bounded do-while iteration over nested steps.
    Loop {
        steps: Vec<StepDefinition>,
        max_iterations: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        until: Option<String>,
    },
    /// Nested sub-workflow invocation.
    Workflow {
        workflow: String,
        #[serde(default)]
        inputs: serde_json::Map<String, Value>,
    },
}

impl StepConfig {
    /// The step type name as it appears in documents.
    pub fn type_name(&self) -> &'static str {
        match self {
            StepConfig::Llm { .. } => "llm",
            StepConfig::Agent { .. } => "agent",
            StepConfig::Integration { .. } => "integration",
            StepConfig::Condition { .. } => "condition",
            StepConfig::Parallel { .. } => "parallel",
            StepConfig::Loop { .. } => "loop",
            StepConfig::Workflow { .. } => "workflow",
        }
    }

    /// Whether the executor's retry wrapper applies to this step type.
    ///
    /// Parallel and loop steps own their iteration semantics and are
    /// never retried as a whole.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StepConfig::Parallel { .. } | StepConfig::Loop { .. })
    }
}

/// Model capability tier, decoupling workflow authors from concrete model
/// identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Fast,
    #[default]
    Balanced,
    Strategic,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Fast => "fast",
            ModelTier::Balanced => "balanced",
            ModelTier::Strategic => "strategic",
        }
    }
}

// ---------------------------------------------------------------------------
// Retry / error policy
// ---------------------------------------------------------------------------

/// Retry configuration for a workflow step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay before the first retry, in seconds (default 1.0).
    #[serde(default = "default_backoff_base")]
    pub backoff_base_seconds: f64,
    /// Multiplier applied per subsequent retry (default 2.0).
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base() -> f64 {
    1.0
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_seconds: default_backoff_base(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before retry `n` (0-based): `base * multiplier^n`.
    pub fn backoff_seconds(&self, retry_index: u32) -> f64 {
        self.backoff_base_seconds * self.backoff_multiplier.powi(retry_index as i32)
    }
}

/// What to do when a step's handler returns an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorPolicy {
    #[serde(default)]
    pub strategy: ErrorStrategy,
    /// Step to dispatch when `strategy` is `fallback`. The executor only
    /// records this id; dispatch happens in the runner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_step_id: Option<String>,
}

/// Error handling strategy for a failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    /// Propagate the error (default).
    #[default]
    Fail,
    /// Mark the step successful and record the error as ignored.
    Ignore,
    /// Retry via the executor's retry wrapper.
    Retry,
    /// Record the fallback step id and surface a distinguishable error.
    Fallback,
}

/// Security permission patterns attached to a step. Pattern-matching
/// semantics live outside the engine; the engine only validates that
/// patterns are non-empty and threads them through.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub tools: Vec<String>,
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Workflow-level cost and token ceilings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowLimits {
    /// Maximum cumulative cost for the run, in USD.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
    /// Maximum cumulative token count for the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    /// What to do when a ceiling is exceeded.
    #[serde(default)]
    pub on_limit: LimitAction,
}

/// Dispatch behaviour when a cost/token ceiling is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitAction {
    /// Abort the run with a structured limit error (default).
    #[default]
    Abort,
    /// Log a warning and continue.
    Warn,
    /// Continue silently.
    Continue,
}

// ---------------------------------------------------------------------------
// Step Result (execution envelope)
// ---------------------------------------------------------------------------

/// Status of an individual step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

/// The envelope the executor returns for one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Step ID matching `StepDefinition.id`.
    pub step_id: String,
    /// Final status.
    pub status: StepStatus,
    /// Externally visible output map (side-band keys already stripped).
    pub output: serde_json::Map<String, Value>,
    /// Error message when `status` is `failed`, or an
    /// `"ignored error: …"` note when an error was suppressed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When execution started.
    pub started_at: DateTime<Utc>,
    /// When execution completed.
    pub completed_at: DateTime<Utc>,
    /// `completed_at - started_at`, in milliseconds.
    pub duration_ms: u64,
    /// Number of attempts performed (1-based).
    pub attempts: u32,
    /// Monetary cost attributed to this step, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    /// Token usage attributed to this step, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    /// Trace id of the child run, for `workflow` steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_trace_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Build a `WorkflowDefinition` exercising every step type.
    fn sample_workflow() -> WorkflowDefinition {
        WorkflowDefinition {
            name: "review-pipeline".to_string(),
            description: Some("Review a diff and summarize findings".to_string()),
            inputs: vec![InputDecl {
                name: "diff".to_string(),
                input_type: InputType::String,
                description: None,
                default: None,
                allowed: None,
                pattern: None,
            }],
            agents: HashMap::from([(
                "reviewer".to_string(),
                AgentDefinition {
                    description: Some("Code review persona".to_string()),
                    system: Some("You are a meticulous reviewer.".to_string()),
                    model: Some(ModelTier::Strategic),
                    tools: vec!["read_file".to_string()],
                },
            )]),
            steps: vec![
                StepDefinition {
                    id: "security".to_string(),
                    condition: None,
                    timeout: Some(120),
                    retry: Some(RetryPolicy::default()),
                    on_error: None,
                    max_tokens: None,
                    max_cost: Some(0.25),
                    permissions: None,
                    config: StepConfig::Llm {
                        prompt: "Review: {{.inputs.diff}}".to_string(),
                        system: None,
                        model: Some(ModelTier::Balanced),
                        tools: vec![],
                        output_schema: None,
                    },
                },
                StepDefinition {
                    id: "lint".to_string(),
                    condition: None,
                    timeout: None,
                    retry: None,
                    on_error: Some(ErrorPolicy {
                        strategy: ErrorStrategy::Ignore,
                        fallback_step_id: None,
                    }),
                    max_tokens: None,
                    max_cost: None,
                    permissions: None,
                    config: StepConfig::Integration {
                        integration: Some("shell.run".to_string()),
                        action: None,
                        operation: None,
                        inputs: serde_json::Map::from_iter([(
                            "command".to_string(),
                            json!("cargo clippy"),
                        )]),
                    },
                },
                StepDefinition {
                    id: "triage".to_string(),
                    condition: Some(ConditionSpec {
                        expression: "steps.security.response != \"\"".to_string(),
                    }),
                    timeout: None,
                    retry: None,
                    on_error: None,
                    max_tokens: None,
                    max_cost: None,
                    permissions: None,
                    config: StepConfig::Condition {
                        then_steps: vec![StepDefinition {
                            id: "escalate".to_string(),
                            condition: None,
                            timeout: None,
                            retry: None,
                            on_error: None,
                            max_tokens: None,
                            max_cost: None,
                            permissions: None,
                            config: StepConfig::Agent {
                                agent: "reviewer".to_string(),
                                prompt: "Escalate: {{.steps.security.response}}".to_string(),
                                output_schema: None,
                            },
                        }],
                        else_steps: vec![],
                    },
                },
                StepDefinition {
                    id: "fan-out".to_string(),
                    condition: None,
                    timeout: None,
                    retry: None,
                    on_error: None,
                    max_tokens: None,
                    max_cost: None,
                    permissions: None,
                    config: StepConfig::Parallel {
                        steps: vec![],
                        max_concurrency: Some(2),
                        foreach: Some("{{.steps.security.response}}".to_string()),
                    },
                },
                StepDefinition {
                    id: "poll".to_string(),
                    condition: None,
                    timeout: Some(30),
                    retry: None,
                    on_error: None,
                    max_tokens: None,
                    max_cost: None,
                    permissions: None,
                    config: StepConfig::Loop {
                        steps: vec![],
                        max_iterations: 5,
                        until: Some("{{.steps.poll-once.response}} == \"done\"".to_string()),
                    },
                },
                StepDefinition {
                    id: "publish".to_string(),
                    condition: None,
                    timeout: None,
                    retry: None,
                    on_error: None,
                    max_tokens: None,
                    max_cost: None,
                    permissions: None,
                    config: StepConfig::Workflow {
                        workflow: "publish.yaml".to_string(),
                        inputs: serde_json::Map::from_iter([(
                            "content".to_string(),
                            json!("{{.steps.security.response}}"),
                        )]),
                    },
                },
            ],
            outputs: vec![OutputDecl {
                name: "summary".to_string(),
                value: "{{.steps.security.response}}".to_string(),
            }],
            limits: Some(WorkflowLimits {
                max_cost: Some(1.0),
                max_tokens: Some(100_000),
                on_limit: LimitAction::Abort,
            }),
        }
    }

    // -----------------------------------------------------------------------
    // YAML / JSON roundtrip
    // -----------------------------------------------------------------------

    #[test]
    fn workflow_definition_yaml_roundtrip() {
        let original = sample_workflow();
        let yaml = serde_yaml_ng::to_string(&original).expect("serialize to YAML");

        assert!(yaml.contains("review-pipeline"));
        assert!(yaml.contains("type: llm"));
        assert!(yaml.contains("type: parallel"));

        let parsed: WorkflowDefinition =
            serde_yaml_ng::from_str(&yaml).expect("deserialize from YAML");
        assert_eq!(parsed.name, "review-pipeline");
        assert_eq!(parsed.steps.len(), 6);
        assert_eq!(parsed.inputs.len(), 1);
        assert_eq!(parsed.outputs.len(), 1);
    }

    #[test]
    fn workflow_definition_json_roundtrip() {
        let original = sample_workflow();
        let json_str = serde_json::to_string_pretty(&original).expect("serialize to JSON");
        let parsed: WorkflowDefinition =
            serde_json::from_str(&json_str).expect("deserialize from JSON");
        assert_eq!(parsed.name, original.name);
        assert_eq!(parsed.steps.len(), original.steps.len());
    }

    #[test]
    fn parse_realistic_yaml_workflow() {
        let yaml = r#"
name: daily-digest
description: Gather and summarize
inputs:
  - name: topic
    type: string
    default: "rust"
steps:
  - id: gather
    type: llm
    prompt: "Find stories about {{.inputs.topic}}"
    model: fast
    timeout: 120
  - id: summarize
    type: llm
    prompt: "Summarize: {{.steps.gather.response}}"
    retry:
      max_attempts: 2
outputs:
  - name: digest
    value: "{{.steps.summarize.response}}"
limits:
  max_cost: 0.50
"#;
        let wf: WorkflowDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(wf.name, "daily-digest");
        assert_eq!(wf.steps.len(), 2);
        assert_eq!(wf.inputs[0].default, Some(json!("rust")));
        match &wf.steps[0].config {
            StepConfig::Llm { model, .. } => assert_eq!(*model, Some(ModelTier::Fast)),
            other => panic!("expected llm step, got {}", other.type_name()),
        }
        assert_eq!(wf.steps[1].retry.as_ref().unwrap().max_attempts, 2);
        // Unspecified retry fields take their defaults.
        assert!((wf.steps[1].retry.as_ref().unwrap().backoff_base_seconds - 1.0).abs() < f64::EPSILON);
        assert_eq!(wf.limits.as_ref().unwrap().max_cost, Some(0.50));
        assert_eq!(wf.limits.as_ref().unwrap().on_limit, LimitAction::Abort);
    }

    // -----------------------------------------------------------------------
    // StepConfig variants
    // -----------------------------------------------------------------------

    #[test]
    fn step_config_tagging() {
        let step = StepDefinition {
            id: "x".to_string(),
            condition: None,
            timeout: None,
            retry: None,
            on_error: None,
            max_tokens: None,
            max_cost: None,
            permissions: None,
            config: StepConfig::Integration {
                integration: None,
                action: Some("http".to_string()),
                operation: Some("get".to_string()),
                inputs: serde_json::Map::new(),
            },
        };
        let json = serde_json::to_string(&step).unwrap();
        assert!(json.contains("\"type\":\"integration\""));
        let parsed: StepDefinition = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed.config, StepConfig::Integration { .. }));
    }

    #[test]
    fn step_config_type_names() {
        let cases: Vec<(StepConfig, &str)> = vec![
            (
                StepConfig::Loop {
                    steps: vec![],
                    max_iterations: 1,
                    until: None,
                },
                "loop",
            ),
            (
                StepConfig::Workflow {
                    workflow: "w.yaml".to_string(),
                    inputs: serde_json::Map::new(),
                },
                "workflow",
            ),
        ];
        for (config, expected) in cases {
            assert_eq!(config.type_name(), expected);
        }
    }

    #[test]
    fn retryable_excludes_parallel_and_loop() {
        let parallel = StepConfig::Parallel {
            steps: vec![],
            max_concurrency: None,
            foreach: None,
        };
        let looped = StepConfig::Loop {
            steps: vec![],
            max_iterations: 3,
            until: None,
        };
        let llm = StepConfig::Llm {
            prompt: "p".to_string(),
            system: None,
            model: None,
            tools: vec![],
            output_schema: None,
        };
        assert!(!parallel.is_retryable());
        assert!(!looped.is_retryable());
        assert!(llm.is_retryable());
    }

    // -----------------------------------------------------------------------
    // RetryPolicy
    // -----------------------------------------------------------------------

    #[test]
    fn retry_policy_defaults() {
        let yaml = "max_attempts: 5";
        let policy: RetryPolicy = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert!((policy.backoff_base_seconds - 1.0).abs() < f64::EPSILON);
        assert!((policy.backoff_multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn retry_policy_backoff_growth() {
        let policy = RetryPolicy {
            max_attempts: 4,
            backoff_base_seconds: 0.5,
            backoff_multiplier: 2.0,
        };
        assert!((policy.backoff_seconds(0) - 0.5).abs() < f64::EPSILON);
        assert!((policy.backoff_seconds(1) - 1.0).abs() < f64::EPSILON);
        assert!((policy.backoff_seconds(2) - 2.0).abs() < f64::EPSILON);
    }

    // -----------------------------------------------------------------------
    // Enums
    // -----------------------------------------------------------------------

    #[test]
    fn error_strategy_serde() {
        for (strategy, expected) in [
            (ErrorStrategy::Fail, "\"fail\""),
            (ErrorStrategy::Ignore, "\"ignore\""),
            (ErrorStrategy::Retry, "\"retry\""),
            (ErrorStrategy::Fallback, "\"fallback\""),
        ] {
            let json = serde_json::to_string(&strategy).unwrap();
            assert_eq!(json, expected);
            let parsed: ErrorStrategy = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, strategy);
        }
    }

    #[test]
    fn model_tier_default_is_balanced() {
        assert_eq!(ModelTier::default(), ModelTier::Balanced);
        assert_eq!(ModelTier::Strategic.as_str(), "strategic");
    }

    #[test]
    fn limit_action_default_is_abort() {
        let limits: WorkflowLimits = serde_yaml_ng::from_str("max_cost: 0.1").unwrap();
        assert_eq!(limits.on_limit, LimitAction::Abort);
    }

    #[test]
    fn step_status_serde() {
        for status in [
            StepStatus::Pending,
            StepStatus::Running,
            StepStatus::Success,
            StepStatus::Failed,
            StepStatus::Skipped,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            let parsed: StepStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, status);
        }
    }

    // -----------------------------------------------------------------------
    // StepResult
    // -----------------------------------------------------------------------

    #[test]
    fn step_result_json_roundtrip() {
        let result = StepResult {
            step_id: "security".to_string(),
            status: StepStatus::Success,
            output: serde_json::Map::from_iter([("response".to_string(), json!("ok"))]),
            error: None,
            started_at: Utc::now(),
            completed_at: Utc::now(),
            duration_ms: 42,
            attempts: 1,
            cost_usd: Some(0.002),
            token_usage: Some(TokenUsage::new(10, 5)),
            child_trace_id: None,
        };
        let json_str = serde_json::to_string(&result).unwrap();
        let parsed: StepResult = serde_json::from_str(&json_str).unwrap();
        assert_eq!(parsed.step_id, "security");
        assert_eq!(parsed.status, StepStatus::Success);
        assert_eq!(parsed.attempts, 1);
        assert_eq!(parsed.token_usage.unwrap().total_tokens, 15);
    }
}
