//! Parallel step handler: concurrent fan-out and array foreach.
//!
//! **Fan-out mode** launches one task per nested step under a semaphore
//! whose capacity is the step's `max_concurrency` (or the executor-wide
//! default). Each task runs against its own copy of the context. The
//! default policy is fail-fast: the first failure cancels the shared
//! token so siblings abort at their next suspension point. With
//! `on_error: ignore` failures are collected and partial outputs kept.
//!
//! **Foreach mode** resolves the `foreach` template as a typed value,
//! requires an array, and runs the nested steps sequentially per element
//! in an isolated context copy with `item`/`index`/`total` bound. All
//! iterations run to completion (fail-last); results are emitted in input
//! order.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use baton_types::error::ValidationError;
use baton_types::llm::TokenUsage;
use baton_types::workflow::{ErrorStrategy, StepConfig, StepDefinition, StepResult};

use crate::context::WorkflowContext;
use crate::executor::{
    ExecScope, HandlerError, HandlerResult, OutputMap, StepError, StepExecutor, StepFailure,
    embed_sidebands,
};
use crate::template;

/// Hard upper bound on foreach array size, checked before any task is
/// launched.
pub const MAX_FOREACH_ITEMS: usize = 10_000;

impl StepExecutor {
    pub(crate) async fn run_parallel(
        &self,
        step: &StepDefinition,
        ctx: &WorkflowContext,
        scope: &ExecScope,
    ) -> HandlerResult {
        let StepConfig::Parallel {
            steps,
            max_concurrency,
            foreach,
        } = &step.config
        else {
            unreachable!("dispatched parallel handler on non-parallel step")
        };
        match foreach.as_deref().filter(|expr| !expr.is_empty()) {
            Some(expr) => {
                self.run_foreach(step, steps, *max_concurrency, expr, ctx, scope)
                    .await
            }
            None => {
                self.run_fanout(step, steps, *max_concurrency, ctx, scope)
                    .await
            }
        }
    }

    fn fanout_width(&self, max_concurrency: Option<usize>) -> usize {
        max_concurrency
            .filter(|width| *width > 0)
            .unwrap_or(self.default_concurrency)
    }

    async fn run_fanout(
        &self,
        step: &StepDefinition,
        children: &[StepDefinition],
        max_concurrency: Option<usize>,
        ctx: &WorkflowContext,
        scope: &ExecScope,
    ) -> HandlerResult {
        let width = self.fanout_width(max_concurrency);
        let semaphore = Arc::new(Semaphore::new(width));
        let fail_fast = step
            .on_error
            .as_ref()
            .map(|policy| policy.strategy != ErrorStrategy::Ignore)
            .unwrap_or(true);
        let shared_cancel = scope.cancel.child_token();

        tracing::debug!(
            step_id = step.id.as_str(),
            children = children.len(),
            width,
            fail_fast,
            "launching parallel fan-out"
        );

        let mut join_set: JoinSet<(String, Result<StepResult, StepFailure>)> = JoinSet::new();
        for child in children {
            let executor = self.clone();
            let child = child.clone();
            let task_ctx = ctx.clone();
            let task_scope = ExecScope {
                deadline: scope.deadline,
                cancel: shared_cancel.clone(),
                visited: Arc::clone(&scope.visited),
            };
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                // A cancelled wait falls through to execute(), which
                // observes the token and returns a cancellation failure.
                let _permit = tokio::select! {
                    _ = task_scope.cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => {
                        Some(permit.expect("parallel semaphore closed"))
                    }
                };
                let outcome = executor.execute(&child, &task_ctx, &task_scope).await;
                (child.id.clone(), outcome)
            });
        }

        let mut output = OutputMap::new();
        let mut usage = TokenUsage::default();
        let mut cost_usd = 0.0;
        let mut first_error: Option<(String, String)> = None;

        while let Some(joined) = join_set.join_next().await {
            let (child_id, outcome) = joined.map_err(|err| {
                HandlerError::new(StepError::Failed(format!("task join error: {err}")))
            })?;
            match outcome {
                Ok(result) => {
                    if let Some(step_usage) = &result.token_usage {
                        usage.add(step_usage);
                    }
                    cost_usd += result.cost_usd.unwrap_or(0.0);
                    output.insert(child_id, Value::Object(result.output));
                }
                Err(failure) => {
                    if let Some(step_usage) = &failure.result.token_usage {
                        usage.add(step_usage);
                    }
                    cost_usd += failure.result.cost_usd.unwrap_or(0.0);
                    // A cancelled sibling still records its partial output
                    // when it produced any.
                    if !failure.result.output.is_empty() {
                        output.insert(child_id.clone(), Value::Object(failure.result.output));
                    }
                    if first_error.is_none() {
                        first_error = Some((child_id, failure.error.to_string()));
                        if fail_fast {
                            shared_cancel.cancel();
                        }
                    }
                }
            }
        }

        embed_sidebands(&mut output, &usage, cost_usd);
        if let Some((step_id, message)) = first_error {
            return Err(HandlerError::with_partial(
                output,
                StepError::Nested { step_id, message },
            ));
        }
        Ok(output)
    }

    async fn run_foreach(
        &self,
        step: &StepDefinition,
        children: &[StepDefinition],
        max_concurrency: Option<usize>,
        foreach: &str,
        ctx: &WorkflowContext,
        scope: &ExecScope,
    ) -> HandlerResult {
        let resolved = template::resolve_typed(foreach, &ctx.template_context())?;
        let Value::Array(items) = resolved else {
            return Err(ValidationError::new(
                format!("steps.{}.foreach", step.id),
                format!(
                    "foreach expression must resolve to an array, got {}",
                    json_type_name(&resolved)
                ),
            )
            .into());
        };
        if items.len() > MAX_FOREACH_ITEMS {
            return Err(ValidationError::new(
                format!("steps.{}.foreach", step.id),
                format!(
                    "foreach array has {} elements, maximum is {MAX_FOREACH_ITEMS}",
                    items.len()
                ),
            )
            .into());
        }
        if items.is_empty() {
            let mut output = OutputMap::new();
            output.insert("results".to_string(), json!([]));
            return Ok(output);
        }

        let total = items.len();
        let width = self.fanout_width(max_concurrency);
        let semaphore = Arc::new(Semaphore::new(width));

        tracing::debug!(
            step_id = step.id.as_str(),
            items = total,
            width,
            "launching foreach fan-out"
        );

        type IterationOutcome = (usize, OutputMap, TokenUsage, f64, Option<String>);
        let mut join_set: JoinSet<IterationOutcome> = JoinSet::new();

        for (index, item) in items.into_iter().enumerate() {
            let executor = self.clone();
            let children = children.to_vec();
            // Each iteration gets a full copy of the context: tasks bind
            // their own loop variables and append their own step outputs,
            // so sharing nested maps with siblings would race.
            let mut task_ctx = ctx.clone();
            task_ctx.bind_foreach(item, index, total);
            let task_scope = scope.clone();
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let _permit = tokio::select! {
                    _ = task_scope.cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => {
                        Some(permit.expect("foreach semaphore closed"))
                    }
                };

                let mut iteration_outputs = OutputMap::new();
                let mut usage = TokenUsage::default();
                let mut cost_usd = 0.0;
                let mut error: Option<String> = None;

                // Nested steps run sequentially within the iteration,
                // stopping at the first error.
                for child in &children {
                    match executor.execute(child, &task_ctx, &task_scope).await {
                        Ok(result) => {
                            if let Some(step_usage) = &result.token_usage {
                                usage.add(step_usage);
                            }
                            cost_usd += result.cost_usd.unwrap_or(0.0);
                            let value = Value::Object(result.output);
                            iteration_outputs.insert(child.id.clone(), value.clone());
                            if let Err(err) = task_ctx.insert_step_output(&child.id, value) {
                                error = Some(format!("step '{}': {err}", child.id));
                                break;
                            }
                        }
                        Err(failure) => {
                            if let Some(step_usage) = &failure.result.token_usage {
                                usage.add(step_usage);
                            }
                            cost_usd += failure.result.cost_usd.unwrap_or(0.0);
                            if !failure.result.output.is_empty() {
                                iteration_outputs.insert(
                                    child.id.clone(),
                                    Value::Object(failure.result.output),
                                );
                            }
                            error = Some(format!("step '{}': {}", child.id, failure.error));
                            break;
                        }
                    }
                }

                (index, iteration_outputs, usage, cost_usd, error)
            });
        }

        let mut slots: Vec<Option<(OutputMap, Option<String>)>> = (0..total).map(|_| None).collect();
        let mut usage = TokenUsage::default();
        let mut cost_usd = 0.0;

        // Fail-last: every iteration runs to completion before the step
        // reports an error.
        while let Some(joined) = join_set.join_next().await {
            let (index, outputs, task_usage, task_cost, error) = joined.map_err(|err| {
                HandlerError::new(StepError::Failed(format!("task join error: {err}")))
            })?;
            usage.add(&task_usage);
            cost_usd += task_cost;
            slots[index] = Some((outputs, error));
        }

        let mut results = Vec::with_capacity(total);
        let mut first_failure: Option<(usize, String)> = None;
        for (index, slot) in slots.into_iter().enumerate() {
            let (outputs, error) = slot.expect("every foreach slot is filled");
            results.push(Value::Object(outputs));
            if let Some(message) = error {
                if first_failure.is_none() {
                    first_failure = Some((index, message));
                }
            }
        }

        let mut output = OutputMap::new();
        output.insert("results".to_string(), Value::Array(results));
        embed_sidebands(&mut output, &usage, cost_usd);

        if let Some((index, message)) = first_failure {
            return Err(HandlerError::with_partial(
                output,
                StepError::Failed(format!("foreach iteration {index} failed: {message}")),
            ));
        }
        Ok(output)
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
