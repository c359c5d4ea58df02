//! Workflow runner: the controller above the step executor.
//!
//! Runs a definition's top-level steps strictly sequentially, threading
//! each step's output into the context. The runner -- not the executor --
//! dispatches fallback steps, decides the run-level outcome from the last
//! executed step, extracts declared workflow outputs, and on a limit
//! abort writes completed step results and the abort reason under a
//! per-run directory. Runs are cancellable by id.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use baton_types::cost::UsageSnapshot;
use baton_types::error::ValidationError;
use baton_types::workflow::{StepDefinition, StepResult, WorkflowDefinition};

use crate::context::WorkflowContext;
use crate::definition;
use crate::executor::{ExecScope, OutputMap, StepError, StepExecutor};
use crate::limits::LimitEnforcer;
use crate::llm::BoxLlmProvider;
use crate::loader::SubworkflowLoader;
use crate::registry::{OperationRegistry, ToolRegistry};
use crate::template;
use crate::tracker::{CostTracker, usage_for_run};

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    /// Aborted by the cost/token limit enforcer.
    Aborted,
    Cancelled,
}

/// Result of one workflow run.
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub status: RunStatus,
    /// Declared workflow outputs, populated on completion.
    pub outputs: OutputMap,
    /// Results of every executed step, in execution order.
    pub step_results: Vec<StepResult>,
    pub error: Option<String>,
    /// Cumulative usage attributed to the run.
    pub usage: UsageSnapshot,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder wiring the runner's collaborators.
#[derive(Default)]
pub struct WorkflowRunnerBuilder {
    provider: Option<Arc<BoxLlmProvider>>,
    tools: Option<Arc<dyn ToolRegistry>>,
    operations: Option<Arc<dyn OperationRegistry>>,
    loader: Option<Arc<dyn SubworkflowLoader>>,
    tracker: Option<Arc<dyn CostTracker>>,
    default_concurrency: Option<usize>,
    partial_results_dir: Option<PathBuf>,
}

impl WorkflowRunnerBuilder {
    pub fn provider(mut self, provider: Arc<BoxLlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn tools(mut self, tools: Arc<dyn ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn operations(mut self, operations: Arc<dyn OperationRegistry>) -> Self {
        self.operations = Some(operations);
        self
    }

    pub fn loader(mut self, loader: Arc<dyn SubworkflowLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn tracker(mut self, tracker: Arc<dyn CostTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn default_concurrency(mut self, width: usize) -> Self {
        self.default_concurrency = Some(width.max(1));
        self
    }

    /// Directory under which aborted runs persist their partial results.
    pub fn partial_results_dir(mut self, dir: PathBuf) -> Self {
        self.partial_results_dir = Some(dir);
        self
    }

    pub fn build(self) -> WorkflowRunner {
        WorkflowRunner {
            provider: self.provider,
            tools: self.tools,
            operations: self.operations,
            loader: self.loader,
            tracker: self
                .tracker
                .unwrap_or_else(|| Arc::new(crate::tracker::InMemoryCostTracker::new())),
            default_concurrency: self.default_concurrency,
            partial_results_dir: self.partial_results_dir,
            cancellations: DashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowRunner
// ---------------------------------------------------------------------------

/// Executes whole workflow definitions.
pub struct WorkflowRunner {
    provider: Option<Arc<BoxLlmProvider>>,
    tools: Option<Arc<dyn ToolRegistry>>,
    operations: Option<Arc<dyn OperationRegistry>>,
    loader: Option<Arc<dyn SubworkflowLoader>>,
    tracker: Arc<dyn CostTracker>,
    default_concurrency: Option<usize>,
    partial_results_dir: Option<PathBuf>,
    /// Cancellation tokens keyed by run id.
    cancellations: DashMap<Uuid, CancellationToken>,
}

impl WorkflowRunner {
    pub fn builder() -> WorkflowRunnerBuilder {
        WorkflowRunnerBuilder::default()
    }

    /// Cancel a running workflow. Returns false when the run id is not
    /// active.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match self.cancellations.remove(&run_id) {
            Some((_, token)) => {
                token.cancel();
                tracing::info!(run_id = %run_id, "workflow run cancelled");
                true
            }
            None => false,
        }
    }

    /// Execute a definition from the beginning.
    ///
    /// Pre-execution problems (invalid definition, missing required
    /// inputs) surface as `Err`; execution failures land in the returned
    /// outcome with the appropriate status.
    pub async fn run(
        &self,
        definition: &WorkflowDefinition,
        inputs: serde_json::Map<String, Value>,
        workflow_dir: Option<PathBuf>,
    ) -> Result<RunOutcome, ValidationError> {
        definition::validate_definition(definition)?;
        let inputs = definition::reconcile_inputs(definition, inputs)?;

        let run_id = Uuid::now_v7();
        let cancel = CancellationToken::new();
        self.cancellations.insert(run_id, cancel.clone());

        let enforcer = definition
            .limits
            .clone()
            .map(|limits| LimitEnforcer::new(limits, Arc::clone(&self.tracker), run_id));

        let mut executor = StepExecutor::new(
            definition.name.clone(),
            run_id,
            Arc::clone(&self.tracker),
        )
        .with_agents(definition.agents.clone());
        if let Some(provider) = &self.provider {
            executor = executor.with_provider(Arc::clone(provider));
        }
        if let Some(tools) = &self.tools {
            executor = executor.with_tools(Arc::clone(tools));
        }
        if let Some(operations) = &self.operations {
            executor = executor.with_operations(Arc::clone(operations));
        }
        if let Some(loader) = &self.loader {
            executor = executor.with_loader(Arc::clone(loader));
        }
        if let Some(enforcer) = &enforcer {
            executor = executor.with_enforcer(enforcer.clone());
        }
        if let Some(dir) = &workflow_dir {
            executor = executor.with_workflow_dir(dir.clone());
        }
        if let Some(width) = self.default_concurrency {
            executor = executor.with_default_concurrency(width);
        }

        let mut ctx = WorkflowContext::new(definition.name.clone(), run_id, inputs);
        if let Some(tools) = &self.tools {
            ctx.tools = tools.list_tools();
        }
        let scope = ExecScope::with_cancel(cancel);

        tracing::info!(
            run_id = %run_id,
            workflow = definition.name.as_str(),
            steps = definition.steps.len(),
            "starting workflow run"
        );

        let mut step_results: Vec<StepResult> = Vec::new();
        let mut status = RunStatus::Completed;
        let mut run_error: Option<String> = None;

        for step in &definition.steps {
            match executor.execute(step, &ctx, &scope).await {
                Ok(result) => {
                    let record_output = result.status != baton_types::workflow::StepStatus::Skipped;
                    let output = Value::Object(result.output.clone());
                    step_results.push(result);
                    // Skipping a step leaves the context untouched.
                    if record_output {
                        if let Err(err) = ctx.insert_step_output(&step.id, output) {
                            status = RunStatus::Failed;
                            run_error = Some(err.to_string());
                            break;
                        }
                    }
                }
                Err(failure) => match failure.error {
                    StepError::Fallback {
                        ref fallback_step_id,
                        ..
                    } => {
                        let fallback_id = fallback_step_id.clone();
                        step_results.push(failure.result);
                        match self
                            .dispatch_fallback(&executor, definition, &fallback_id, &ctx, &scope)
                            .await
                        {
                            Ok(result) => {
                                let record_output = result.status
                                    != baton_types::workflow::StepStatus::Skipped;
                                let output = Value::Object(result.output.clone());
                                let step_id = result.step_id.clone();
                                step_results.push(result);
                                if record_output {
                                    if let Err(err) = ctx.insert_step_output(&step_id, output) {
                                        status = RunStatus::Failed;
                                        run_error = Some(err.to_string());
                                        break;
                                    }
                                }
                            }
                            Err(error) => {
                                status = RunStatus::Failed;
                                run_error = Some(error);
                                break;
                            }
                        }
                    }
                    StepError::Limit(ref limit) => {
                        run_error = Some(limit.to_string());
                        status = RunStatus::Aborted;
                        step_results.push(failure.result);
                        self.write_partial_results(
                            run_id,
                            &step_results,
                            run_error.as_deref().unwrap_or_default(),
                        );
                        break;
                    }
                    StepError::Cancelled => {
                        run_error = failure.result.error.clone();
                        status = RunStatus::Cancelled;
                        step_results.push(failure.result);
                        break;
                    }
                    _ => {
                        run_error = failure.result.error.clone();
                        status = RunStatus::Failed;
                        step_results.push(failure.result);
                        break;
                    }
                },
            }
        }

        // Declared outputs are extracted only from completed runs.
        let mut outputs = OutputMap::new();
        if status == RunStatus::Completed {
            let template_ctx = ctx.template_context();
            for declaration in &definition.outputs {
                match template::resolve_typed(&declaration.value, &template_ctx) {
                    Ok(value) => {
                        outputs.insert(declaration.name.clone(), value);
                    }
                    Err(err) => {
                        status = RunStatus::Failed;
                        run_error = Some(format!(
                            "failed to resolve output '{}': {err}",
                            declaration.name
                        ));
                        outputs.clear();
                        break;
                    }
                }
            }
        }

        self.cancellations.remove(&run_id);
        let usage = usage_for_run(self.tracker.as_ref(), run_id);

        tracing::info!(
            run_id = %run_id,
            workflow = definition.name.as_str(),
            status = ?status,
            steps_executed = step_results.len(),
            total_cost_usd = usage.total_cost_usd,
            "workflow run finished"
        );

        Ok(RunOutcome {
            run_id,
            status,
            outputs,
            step_results,
            error: run_error,
            usage,
        })
    }

    /// Dispatch the fallback step named by a failed step's error policy.
    /// The executor only records the id; dispatch lives here.
    async fn dispatch_fallback(
        &self,
        executor: &StepExecutor,
        definition: &WorkflowDefinition,
        fallback_id: &str,
        ctx: &WorkflowContext,
        scope: &ExecScope,
    ) -> Result<StepResult, String> {
        let fallback: &StepDefinition = definition
            .steps
            .iter()
            .find(|candidate| candidate.id == fallback_id)
            .ok_or_else(|| format!("fallback step '{fallback_id}' not found"))?;
        tracing::debug!(fallback = fallback_id, "dispatching fallback step");
        executor
            .execute(fallback, ctx, scope)
            .await
            .map_err(|failure| {
                failure
                    .result
                    .error
                    .unwrap_or_else(|| "fallback step failed".to_string())
            })
    }

    /// Persist completed step results and the abort reason under the
    /// per-run directory. Best-effort: failures are logged, never fatal.
    fn write_partial_results(&self, run_id: Uuid, step_results: &[StepResult], reason: &str) {
        let Some(base) = &self.partial_results_dir else {
            return;
        };
        let run_dir = base.join(run_id.to_string());
        if let Err(err) = std::fs::create_dir_all(&run_dir) {
            tracing::warn!(run_id = %run_id, error = %err, "failed to create partial results dir");
            return;
        }
        for result in step_results {
            let path = run_dir.join(format!("{}.json", result.step_id));
            match serde_json::to_string_pretty(result) {
                Ok(serialized) => {
                    if let Err(err) = std::fs::write(&path, serialized) {
                        tracing::warn!(run_id = %run_id, error = %err, "failed to write step result");
                    }
                }
                Err(err) => {
                    tracing::warn!(run_id = %run_id, error = %err, "failed to serialize step result");
                }
            }
        }
        let abort = json!({ "run_id": run_id.to_string(), "reason": reason });
        let path = run_dir.join("abort_reason.json");
        if let Err(err) = std::fs::write(&path, abort.to_string()) {
            tracing::warn!(run_id = %run_id, error = %err, "failed to write abort reason");
        }
    }
}
