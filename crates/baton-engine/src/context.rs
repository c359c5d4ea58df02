//! Workflow execution context with step output tracking.
//!
//! `WorkflowContext` is the mutable state that flows through a workflow
//! run. It aggregates caller inputs, completed step outputs, an
//! environment snapshot, the current loop scope, and tool descriptors,
//! with size limits to prevent unbounded memory growth.
//!
//! Cloning a context produces a fully independent copy; spawned tasks in
//! parallel and foreach blocks each receive their own clone and never
//! share nested maps with siblings.

use serde_json::{Value, json};
use uuid::Uuid;

use baton_types::llm::ToolDescriptor;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum size of a single step output (1 MiB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

/// Maximum total size of all context data (10 MiB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

// ---------------------------------------------------------------------------
// Loop scope
// ---------------------------------------------------------------------------

/// Loop variables visible while executing inside a loop step.
#[derive(Debug, Clone)]
pub struct LoopScope {
    /// 0-based iteration counter.
    pub iteration: u32,
    pub max_iterations: u32,
    /// Prior iteration records (already masked).
    pub history: Vec<Value>,
}

// ---------------------------------------------------------------------------
// WorkflowContext
// ---------------------------------------------------------------------------

/// Mutable per-run state seen by steps.
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    /// Caller inputs reconciled with the input declarations. Foreach tasks
    /// additionally bind `item`, `index`, and `total` here.
    pub inputs: serde_json::Map<String, Value>,
    /// Completed step outputs keyed by step ID.
    pub steps: serde_json::Map<String, Value>,
    /// Environment variable snapshot taken at run start.
    pub env: serde_json::Map<String, Value>,
    /// Loop variables, present only inside a loop step.
    pub loop_scope: Option<LoopScope>,
    /// Tool descriptors visible to LLM steps.
    pub tools: Vec<ToolDescriptor>,
    /// Workflow name, for attribution and logging.
    pub workflow_name: String,
    /// Run ID, for cost attribution.
    pub run_id: Uuid,
}

impl WorkflowContext {
    /// Create a context for a fresh run, snapshotting the process
    /// environment.
    pub fn new(
        workflow_name: impl Into<String>,
        run_id: Uuid,
        inputs: serde_json::Map<String, Value>,
    ) -> Self {
        let env = std::env::vars()
            .map(|(key, value)| (key, Value::String(value)))
            .collect();
        Self {
            inputs,
            steps: serde_json::Map::new(),
            env,
            loop_scope: None,
            tools: Vec::new(),
            workflow_name: workflow_name.into(),
            run_id,
        }
    }

    /// Create a context with an explicit environment snapshot (used by
    /// sub-workflows and tests).
    pub fn with_env(
        workflow_name: impl Into<String>,
        run_id: Uuid,
        inputs: serde_json::Map<String, Value>,
        env: serde_json::Map<String, Value>,
    ) -> Self {
        Self {
            inputs,
            steps: serde_json::Map::new(),
            env,
            loop_scope: None,
            tools: Vec::new(),
            workflow_name: workflow_name.into(),
            run_id,
        }
    }

    /// Store the output of a completed step.
    ///
    /// Outputs above [`MAX_STEP_OUTPUT_SIZE`] are replaced with a
    /// truncation stub; a total above [`MAX_CONTEXT_SIZE`] is an error.
    pub fn insert_step_output(
        &mut self,
        step_id: &str,
        output: Value,
    ) -> Result<(), ContextError> {
        let serialized = serde_json::to_string(&output)
            .map_err(|e| ContextError::Serialization(e.to_string()))?;

        if serialized.len() > MAX_STEP_OUTPUT_SIZE {
            tracing::warn!(
                step_id,
                size = serialized.len(),
                max = MAX_STEP_OUTPUT_SIZE,
                "step output exceeds size limit, truncating"
            );
            let stub = json!({
                "_truncated": true,
                "_original_size": serialized.len(),
                "_message": format!(
                    "output exceeded {MAX_STEP_OUTPUT_SIZE} byte limit and was truncated"
                )
            });
            self.steps.insert(step_id.to_string(), stub);
        } else {
            self.steps.insert(step_id.to_string(), output);
        }

        let total = self.total_size();
        if total > MAX_CONTEXT_SIZE {
            return Err(ContextError::ContextTooLarge {
                size: total,
                max: MAX_CONTEXT_SIZE,
            });
        }

        Ok(())
    }

    /// Get the output of a completed step.
    pub fn step_output(&self, step_id: &str) -> Option<&Value> {
        self.steps.get(step_id)
    }

    /// Bind the foreach element variables into the input scope.
    pub fn bind_foreach(&mut self, item: Value, index: usize, total: usize) {
        self.inputs.insert("item".to_string(), item);
        self.inputs.insert("index".to_string(), json!(index));
        self.inputs.insert("total".to_string(), json!(total));
    }

    /// Total serialized size of all context data in bytes.
    pub fn total_size(&self) -> usize {
        let size_of = |v: &Value| serde_json::to_string(v).map(|s| s.len()).unwrap_or(0);
        let inputs: usize = self.inputs.values().map(size_of).sum();
        let steps: usize = self.steps.values().map(size_of).sum();
        inputs + steps
    }

    /// Build the JSON object templates and expressions evaluate against.
    ///
    /// Shape:
    /// ```json
    /// {
    ///   "<input>": ...,            // inputs merged at the root
    ///   "inputs": { ... },
    ///   "steps": { "<step_id>": { ... }, ... },
    ///   "env": { ... },
    ///   "loop": { "iteration": 0, "max_iterations": 5, "history": [...] },
    ///   "workflow": { "name": "...", "run_id": "..." }
    /// }
    /// ```
    ///
    /// Inputs appear both at the root (so `{{.diff}}` works) and under
    /// `inputs` (so `{{.inputs.diff}}` works).
    pub fn template_context(&self) -> Value {
        let mut root = serde_json::Map::new();
        for (name, value) in &self.inputs {
            root.insert(name.clone(), value.clone());
        }
        root.insert("inputs".to_string(), Value::Object(self.inputs.clone()));
        root.insert("steps".to_string(), Value::Object(self.steps.clone()));
        root.insert("env".to_string(), Value::Object(self.env.clone()));
        if let Some(scope) = &self.loop_scope {
            root.insert(
                "loop".to_string(),
                json!({
                    "iteration": scope.iteration,
                    "max_iterations": scope.max_iterations,
                    "history": scope.history,
                }),
            );
        }
        if !self.tools.is_empty() {
            root.insert(
                "tools".to_string(),
                serde_json::to_value(&self.tools).unwrap_or(Value::Null),
            );
        }
        root.insert(
            "workflow".to_string(),
            json!({
                "name": self.workflow_name,
                "run_id": self.run_id.to_string(),
            }),
        );
        Value::Object(root)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from context mutation.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("context serialization failed: {0}")]
    Serialization(String),

    #[error("total context size ({size} bytes) exceeds maximum ({max} bytes)")]
    ContextTooLarge { size: usize, max: usize },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
