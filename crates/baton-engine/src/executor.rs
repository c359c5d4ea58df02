//! Step executor: the per-step pipeline.
//!
//! `execute` runs one step through the pipeline: condition gate, limit
//! pre-check, deadline framing, retry wrapper, type dispatch, side-band
//! extraction, limit post-check, and `on_error` strategy handling. The
//! type-specific handlers live in `steps/` as further impl blocks on
//! [`StepExecutor`]; composite handlers recurse back into `execute`.
//!
//! # Deadlines and cancellation
//!
//! A step's deadline is the minimum of its own timeout and the
//! surrounding scope's deadline, so a child deadline is never longer than
//! its parent's. Every suspension point (retry backoff, semaphore waits in
//! the composite handlers) checks the scope's cancellation token.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use baton_types::error::{ConfigError, SchemaViolation, ValidationError};
use baton_types::llm::{LlmError, TokenUsage};
use baton_types::workflow::{
    AgentDefinition, ErrorStrategy, RetryPolicy, StepConfig, StepDefinition, StepResult,
    StepStatus,
};

use crate::context::WorkflowContext;
use crate::expression::{self, ExpressionError};
use crate::limits::{LimitEnforcer, LimitError};
use crate::llm::BoxLlmProvider;
use crate::loader::SubworkflowLoader;
use crate::registry::{OperationRegistry, ToolRegistry};
use crate::template::TemplateError;
use crate::tracker::CostTracker;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default timeout for llm and agent steps (10 minutes).
pub const DEFAULT_LLM_TIMEOUT_SECS: u64 = 600;

/// Default timeout for integration steps (2 minutes).
pub const DEFAULT_INTEGRATION_TIMEOUT_SECS: u64 = 120;

/// Executor-wide default parallel fan-out width.
pub const DEFAULT_PARALLEL_CONCURRENCY: usize = 3;

/// Side-band key carrying token usage up from a handler.
pub const USAGE_KEY: &str = "_usage";

/// Side-band key carrying monetary cost up from a handler.
pub const COST_KEY: &str = "_cost";

/// Side-band key carrying the child trace id up from a workflow step.
pub const CHILD_TRACE_KEY: &str = "_child_trace_id";

/// A step's externally visible output map.
pub type OutputMap = serde_json::Map<String, Value>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Typed classification of a step failure.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("llm error: {0}")]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Schema(Box<SchemaViolation>),

    #[error(transparent)]
    Limit(#[from] LimitError),

    #[error("operation error: {0}")]
    Operation(#[from] anyhow::Error),

    /// A nested step inside a composite failed.
    #[error("nested step '{step_id}' failed: {message}")]
    Nested { step_id: String, message: String },

    /// A sub-workflow step failed; the message is the breadcrumb-formatted
    /// path to the failing child step.
    #[error("{0}")]
    Subworkflow(String),

    #[error("step timed out")]
    Timeout,

    #[error("step cancelled")]
    Cancelled,

    /// A collaborator violated its contract. Never retried.
    #[error("contract violation: {0}")]
    Contract(String),

    /// The step failed and its error policy names a fallback step; the
    /// executor records the id but never dispatches it -- that lives in
    /// the runner.
    #[error("step failed ({message}); dispatch fallback step '{fallback_step_id}'")]
    Fallback {
        fallback_step_id: String,
        message: String,
    },

    #[error("{0}")]
    Failed(String),
}

impl From<SchemaViolation> for StepError {
    fn from(violation: SchemaViolation) -> Self {
        StepError::Schema(Box::new(violation))
    }
}

impl StepError {
    /// Whether the retry wrapper may re-attempt after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            StepError::Validation(_)
                | StepError::Config(_)
                | StepError::Contract(_)
                | StepError::Limit(_)
                | StepError::Schema(_)
                | StepError::Timeout
                | StepError::Cancelled
                | StepError::Fallback { .. }
        )
    }

    /// Whether the step's `on_error` strategy applies to this error.
    ///
    /// Validation, configuration, contract, and limit errors bypass the
    /// strategy and always propagate.
    pub fn subject_to_on_error(&self) -> bool {
        !matches!(
            self,
            StepError::Validation(_)
                | StepError::Config(_)
                | StepError::Contract(_)
                | StepError::Limit(_)
        )
    }
}

/// A failed step execution: the full result envelope (status `failed`,
/// partial output, timing) plus the typed error the caller dispatches on.
#[derive(Debug)]
pub struct StepFailure {
    pub result: StepResult,
    pub error: StepError,
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "step '{}' failed: {}", self.result.step_id, self.error)
    }
}

impl std::error::Error for StepFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Internal handler failure: the typed error plus whatever partial output
/// the handler produced before failing.
#[derive(Debug)]
pub(crate) struct HandlerError {
    pub partial: OutputMap,
    pub error: StepError,
}

impl HandlerError {
    pub(crate) fn new(error: impl Into<StepError>) -> Self {
        Self {
            partial: OutputMap::new(),
            error: error.into(),
        }
    }

    pub(crate) fn with_partial(partial: OutputMap, error: impl Into<StepError>) -> Self {
        Self {
            partial,
            error: error.into(),
        }
    }
}

impl From<StepError> for HandlerError {
    fn from(error: StepError) -> Self {
        Self::new(error)
    }
}

impl From<TemplateError> for HandlerError {
    fn from(error: TemplateError) -> Self {
        Self::new(StepError::Template(error))
    }
}

impl From<ExpressionError> for HandlerError {
    fn from(error: ExpressionError) -> Self {
        Self::new(StepError::Expression(error))
    }
}

impl From<ValidationError> for HandlerError {
    fn from(error: ValidationError) -> Self {
        Self::new(StepError::Validation(error))
    }
}

impl From<ConfigError> for HandlerError {
    fn from(error: ConfigError) -> Self {
        Self::new(StepError::Config(error))
    }
}

pub(crate) type HandlerResult = Result<OutputMap, HandlerError>;

// ---------------------------------------------------------------------------
// ExecScope
// ---------------------------------------------------------------------------

/// Per-call execution scope: the inherited deadline, the shared
/// cancellation token, and the sub-workflow paths already on the call
/// chain (recursion guard).
#[derive(Clone)]
pub struct ExecScope {
    pub deadline: Option<Instant>,
    pub cancel: CancellationToken,
    pub(crate) visited: Arc<Vec<PathBuf>>,
}

impl ExecScope {
    pub fn new() -> Self {
        Self {
            deadline: None,
            cancel: CancellationToken::new(),
            visited: Arc::new(Vec::new()),
        }
    }

    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            deadline: None,
            cancel,
            visited: Arc::new(Vec::new()),
        }
    }

    /// Time left until the deadline; `None` means unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_some_and(|remaining| remaining.is_zero())
    }

    /// Narrow the scope with a step timeout; the child deadline is never
    /// later than the parent's.
    pub(crate) fn narrowed(&self, timeout_secs: Option<u64>) -> ExecScope {
        let from_timeout = timeout_secs.map(|secs| Instant::now() + Duration::from_secs(secs));
        let deadline = match (self.deadline, from_timeout) {
            (Some(parent), Some(own)) => Some(parent.min(own)),
            (parent, own) => parent.or(own),
        };
        ExecScope {
            deadline,
            cancel: self.cancel.clone(),
            visited: Arc::clone(&self.visited),
        }
    }

    /// Scope for a sub-workflow invocation, extending the visited chain.
    pub(crate) fn entering_workflow(&self, path: PathBuf) -> ExecScope {
        let mut visited = (*self.visited).clone();
        visited.push(path);
        ExecScope {
            deadline: self.deadline,
            cancel: self.cancel.clone(),
            visited: Arc::new(visited),
        }
    }
}

impl Default for ExecScope {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Dispatches one step by type, enforcing condition, timeout, retry, and
/// per-step limits, shaping outputs and aggregating usage/cost metadata.
///
/// Cheap to clone; all collaborators are shared behind `Arc`.
#[derive(Clone)]
pub struct StepExecutor {
    pub(crate) provider: Option<Arc<BoxLlmProvider>>,
    pub(crate) tools: Option<Arc<dyn ToolRegistry>>,
    pub(crate) operations: Option<Arc<dyn OperationRegistry>>,
    pub(crate) loader: Option<Arc<dyn SubworkflowLoader>>,
    pub(crate) tracker: Arc<dyn CostTracker>,
    pub(crate) enforcer: Option<LimitEnforcer>,
    pub(crate) agents: Arc<HashMap<String, AgentDefinition>>,
    pub(crate) workflow_name: String,
    pub(crate) workflow_dir: Option<PathBuf>,
    pub(crate) run_id: Uuid,
    pub(crate) default_concurrency: usize,
}

impl StepExecutor {
    /// Create an executor with no optional collaborators wired.
    pub fn new(
        workflow_name: impl Into<String>,
        run_id: Uuid,
        tracker: Arc<dyn CostTracker>,
    ) -> Self {
        Self {
            provider: None,
            tools: None,
            operations: None,
            loader: None,
            tracker,
            enforcer: None,
            agents: Arc::new(HashMap::new()),
            workflow_name: workflow_name.into(),
            workflow_dir: None,
            run_id,
            default_concurrency: DEFAULT_PARALLEL_CONCURRENCY,
        }
    }

    pub fn with_provider(mut self, provider: Arc<BoxLlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_operations(mut self, operations: Arc<dyn OperationRegistry>) -> Self {
        self.operations = Some(operations);
        self
    }

    pub fn with_loader(mut self, loader: Arc<dyn SubworkflowLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn with_enforcer(mut self, enforcer: LimitEnforcer) -> Self {
        self.enforcer = Some(enforcer);
        self
    }

    pub fn with_agents(mut self, agents: HashMap<String, AgentDefinition>) -> Self {
        self.agents = Arc::new(agents);
        self
    }

    pub fn with_workflow_dir(mut self, dir: PathBuf) -> Self {
        self.workflow_dir = Some(dir);
        self
    }

    pub fn with_default_concurrency(mut self, width: usize) -> Self {
        self.default_concurrency = width.max(1);
        self
    }

    /// Execute one step against the context.
    ///
    /// Returns the result envelope on success (including skips); failures
    /// come back as [`StepFailure`] carrying the envelope with whatever
    /// partial output the step produced.
    pub fn execute<'a>(
        &'a self,
        step: &'a StepDefinition,
        ctx: &'a WorkflowContext,
        scope: &'a ExecScope,
    ) -> Pin<Box<dyn Future<Output = Result<StepResult, StepFailure>> + Send + 'a>> {
        Box::pin(self.execute_inner(step, ctx, scope))
    }

    async fn execute_inner(
        &self,
        step: &StepDefinition,
        ctx: &WorkflowContext,
        scope: &ExecScope,
    ) -> Result<StepResult, StepFailure> {
        let started_at = Utc::now();
        tracing::debug!(
            run_id = %self.run_id,
            step_id = step.id.as_str(),
            step_type = step.config.type_name(),
            "executing step"
        );

        // 1. Condition gate. For condition-type steps the expression is
        // the branch selector, not a gate; the handler consumes it.
        if !matches!(step.config, StepConfig::Condition { .. }) {
            if let Some(condition) = &step.condition {
                match expression::evaluate_bool(&condition.expression, &ctx.template_context()) {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!(step_id = step.id.as_str(), "condition false, skipping");
                        return Ok(skipped_result(step, started_at));
                    }
                    Err(err) => {
                        return Err(self.failure(
                            step,
                            started_at,
                            0,
                            OutputMap::new(),
                            None,
                            None,
                            None,
                            StepError::Expression(err),
                        ));
                    }
                }
            }
        }

        // 2. Limit pre-check. Limit errors bypass `on_error`.
        if let Some(enforcer) = &self.enforcer {
            if let Err(err) = enforcer.check_before_step(step) {
                return Err(self.failure(
                    step,
                    started_at,
                    0,
                    OutputMap::new(),
                    None,
                    None,
                    None,
                    StepError::Limit(err),
                ));
            }
        }

        // 3. Deadline framing. Composite steps inherit the surrounding
        // deadline unless they set their own timeout; a loop timeout of 0
        // also means inherit.
        let type_default = match step.config {
            StepConfig::Llm { .. } | StepConfig::Agent { .. } => Some(DEFAULT_LLM_TIMEOUT_SECS),
            StepConfig::Integration { .. } => Some(DEFAULT_INTEGRATION_TIMEOUT_SECS),
            _ => None,
        };
        let timeout_secs = match step.timeout {
            Some(0) | None => type_default,
            Some(secs) => Some(secs),
        };
        let step_scope = scope.narrowed(timeout_secs);

        // 4. Retry wrapper.
        let policy = effective_retry_policy(step);
        let max_attempts = if step.config.is_retryable() {
            policy.max_attempts.max(1)
        } else {
            1
        };

        let mut attempts = 0u32;
        let outcome: HandlerResult = loop {
            attempts += 1;
            if step_scope.cancel.is_cancelled() {
                break Err(HandlerError::new(StepError::Cancelled));
            }
            if step_scope.expired() {
                break Err(HandlerError::new(StepError::Timeout));
            }

            let attempt = self.dispatch(step, ctx, &step_scope);
            let attempt_outcome = match step_scope.remaining() {
                Some(remaining) => match tokio::time::timeout(remaining, attempt).await {
                    Ok(outcome) => outcome,
                    Err(_elapsed) => Err(HandlerError::new(StepError::Timeout)),
                },
                None => attempt.await,
            };

            match attempt_outcome {
                Ok(output) => break Ok(output),
                Err(failure) => {
                    if attempts >= max_attempts || !failure.error.is_retryable() {
                        break Err(failure);
                    }
                    let delay =
                        Duration::from_secs_f64(policy.backoff_seconds(attempts - 1).max(0.0));
                    // Retry is abandoned when the backoff would outlive
                    // the deadline.
                    if step_scope
                        .remaining()
                        .is_some_and(|remaining| delay >= remaining)
                    {
                        break Err(failure);
                    }
                    tracing::debug!(
                        step_id = step.id.as_str(),
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure.error,
                        "step failed, retrying after backoff"
                    );
                    tokio::select! {
                        _ = step_scope.cancel.cancelled() => {
                            break Err(HandlerError::with_partial(
                                failure.partial,
                                StepError::Cancelled,
                            ));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        // 5./6. Side-band extraction, post-check, and error policy.
        match outcome {
            Ok(mut output) => {
                let (usage, cost_usd, child_trace_id) = extract_sidebands(&mut output);
                if let Some(enforcer) = &self.enforcer {
                    if let Err(err) = enforcer.check_after_step(
                        step,
                        &usage.unwrap_or_default(),
                        cost_usd.unwrap_or(0.0),
                    ) {
                        return Err(self.failure(
                            step,
                            started_at,
                            attempts,
                            output,
                            usage,
                            cost_usd,
                            child_trace_id,
                            StepError::Limit(err),
                        ));
                    }
                }
                Ok(self.success(
                    step,
                    started_at,
                    attempts,
                    output,
                    None,
                    usage,
                    cost_usd,
                    child_trace_id,
                ))
            }
            Err(HandlerError { mut partial, error }) => {
                let (usage, cost_usd, child_trace_id) = extract_sidebands(&mut partial);
                let strategy = step
                    .on_error
                    .as_ref()
                    .map(|policy| policy.strategy)
                    .unwrap_or_default();

                if error.subject_to_on_error() {
                    match strategy {
                        ErrorStrategy::Ignore => {
                            tracing::debug!(
                                step_id = step.id.as_str(),
                                error = %error,
                                "suppressing step error per on_error policy"
                            );
                            return Ok(self.success(
                                step,
                                started_at,
                                attempts,
                                partial,
                                Some(format!("ignored error: {error}")),
                                usage,
                                cost_usd,
                                child_trace_id,
                            ));
                        }
                        ErrorStrategy::Fallback => {
                            if let Some(fallback_id) = step
                                .on_error
                                .as_ref()
                                .and_then(|policy| policy.fallback_step_id.clone())
                            {
                                partial.insert(
                                    "fallback_step_id".to_string(),
                                    json!(fallback_id.clone()),
                                );
                                let message = error.to_string();
                                return Err(self.failure(
                                    step,
                                    started_at,
                                    attempts,
                                    partial,
                                    usage,
                                    cost_usd,
                                    child_trace_id,
                                    StepError::Fallback {
                                        fallback_step_id: fallback_id,
                                        message,
                                    },
                                ));
                            }
                            // A fallback strategy without a step id
                            // degenerates to fail.
                        }
                        ErrorStrategy::Fail | ErrorStrategy::Retry => {}
                    }
                }

                Err(self.failure(
                    step,
                    started_at,
                    attempts,
                    partial,
                    usage,
                    cost_usd,
                    child_trace_id,
                    error,
                ))
            }
        }
    }

    async fn dispatch(
        &self,
        step: &StepDefinition,
        ctx: &WorkflowContext,
        scope: &ExecScope,
    ) -> HandlerResult {
        match &step.config {
            StepConfig::Llm { .. } => self.run_llm(step, ctx).await,
            StepConfig::Agent { .. } => self.run_agent(step, ctx).await,
            StepConfig::Integration { .. } => self.run_integration(step, ctx).await,
            StepConfig::Condition { .. } => self.run_condition(step, ctx, scope).await,
            StepConfig::Parallel { .. } => self.run_parallel(step, ctx, scope).await,
            StepConfig::Loop { .. } => self.run_loop(step, ctx, scope).await,
            StepConfig::Workflow { .. } => self.run_subworkflow(step, ctx, scope).await,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn success(
        &self,
        step: &StepDefinition,
        started_at: DateTime<Utc>,
        attempts: u32,
        output: OutputMap,
        error: Option<String>,
        token_usage: Option<TokenUsage>,
        cost_usd: Option<f64>,
        child_trace_id: Option<String>,
    ) -> StepResult {
        let completed_at = Utc::now();
        tracing::debug!(
            run_id = %self.run_id,
            step_id = step.id.as_str(),
            attempts,
            duration_ms = duration_ms(started_at, completed_at),
            "step succeeded"
        );
        StepResult {
            step_id: step.id.clone(),
            status: StepStatus::Success,
            output,
            error,
            started_at,
            completed_at,
            duration_ms: duration_ms(started_at, completed_at),
            attempts,
            cost_usd,
            token_usage,
            child_trace_id,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn failure(
        &self,
        step: &StepDefinition,
        started_at: DateTime<Utc>,
        attempts: u32,
        output: OutputMap,
        token_usage: Option<TokenUsage>,
        cost_usd: Option<f64>,
        child_trace_id: Option<String>,
        error: StepError,
    ) -> StepFailure {
        let completed_at = Utc::now();
        tracing::debug!(
            run_id = %self.run_id,
            step_id = step.id.as_str(),
            attempts,
            error = %error,
            "step failed"
        );
        StepFailure {
            result: StepResult {
                step_id: step.id.clone(),
                status: StepStatus::Failed,
                output,
                error: Some(error.to_string()),
                started_at,
                completed_at,
                duration_ms: duration_ms(started_at, completed_at),
                attempts,
                cost_usd,
                token_usage,
                child_trace_id,
            },
            error,
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// The canonical skipped result: no error handler runs, and the output
/// carries the conventional placeholder keys.
fn skipped_result(step: &StepDefinition, started_at: DateTime<Utc>) -> StepResult {
    let completed_at = Utc::now();
    let output = json!({
        "response": "",
        "content": "",
        "skipped": true,
        "reason": "condition evaluated to false",
        "status": "skipped",
        "stdout": "",
        "stderr": "",
        "exit_code": 0,
    });
    let Value::Object(output) = output else {
        unreachable!("skipped output literal is an object")
    };
    StepResult {
        step_id: step.id.clone(),
        status: StepStatus::Skipped,
        output,
        error: None,
        started_at,
        completed_at,
        duration_ms: duration_ms(started_at, completed_at),
        attempts: 0,
        cost_usd: None,
        token_usage: None,
        child_trace_id: None,
    }
}

fn duration_ms(started_at: DateTime<Utc>, completed_at: DateTime<Utc>) -> u64 {
    (completed_at - started_at).num_milliseconds().max(0) as u64
}

/// The retry policy in effect for a step: an explicit `retry` block wins;
/// `on_error: retry` without one uses the default policy; otherwise a
/// single attempt.
fn effective_retry_policy(step: &StepDefinition) -> RetryPolicy {
    if let Some(policy) = &step.retry {
        return policy.clone();
    }
    let wants_retry = step
        .on_error
        .as_ref()
        .is_some_and(|policy| policy.strategy == ErrorStrategy::Retry);
    if wants_retry {
        RetryPolicy::default()
    } else {
        RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        }
    }
}

/// Remove the reserved side-band keys from an output map.
///
/// Idempotent: a second extraction finds nothing and leaves the map
/// unchanged.
pub fn extract_sidebands(
    output: &mut OutputMap,
) -> (Option<TokenUsage>, Option<f64>, Option<String>) {
    let usage = output
        .remove(USAGE_KEY)
        .and_then(|value| serde_json::from_value::<TokenUsage>(value).ok());
    let cost_usd = output.remove(COST_KEY).and_then(|value| value.as_f64());
    let child_trace_id = output
        .remove(CHILD_TRACE_KEY)
        .and_then(|value| value.as_str().map(str::to_string));
    (usage, cost_usd, child_trace_id)
}

/// Embed usage/cost side-bands into a handler output map.
pub(crate) fn embed_sidebands(output: &mut OutputMap, usage: &TokenUsage, cost_usd: f64) {
    if !usage.is_zero() {
        output.insert(
            USAGE_KEY.to_string(),
            serde_json::to_value(usage).unwrap_or(Value::Null),
        );
    }
    if cost_usd > 0.0 {
        output.insert(COST_KEY.to_string(), json!(cost_usd));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
