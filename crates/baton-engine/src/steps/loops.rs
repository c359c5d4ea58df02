//! Loop step handler: bounded do-while iteration.
//!
//! Each iteration runs against a fresh copy of the workflow context with
//! `loop.{iteration, max_iterations, history}` injected and the latest
//! nested-step outputs threaded in. Termination: the `until` expression
//! (template-resolved, then evaluated), the `max_iterations` cap, the
//! surrounding deadline, or an unhandled nested error. The iteration
//! history is masked and bounded to 1 MiB, dropping oldest records first
//! but always keeping at least one.

use chrono::Utc;
use serde_json::{Value, json};
use tokio::time::Instant;

use baton_types::llm::TokenUsage;
use baton_types::workflow::{ErrorStrategy, StepConfig, StepDefinition, StepStatus};

use crate::context::{LoopScope, WorkflowContext};
use crate::executor::{
    ExecScope, HandlerError, HandlerResult, OutputMap, StepError, StepExecutor, embed_sidebands,
};
use crate::expression;
use crate::mask;
use crate::template;

/// Serialized history cap; oldest records are dropped FIFO past this.
pub const MAX_HISTORY_BYTES: usize = 1_048_576;

impl StepExecutor {
    pub(crate) async fn run_loop(
        &self,
        step: &StepDefinition,
        ctx: &WorkflowContext,
        scope: &ExecScope,
    ) -> HandlerResult {
        let StepConfig::Loop {
            steps: body,
            max_iterations,
            until,
        } = &step.config
        else {
            unreachable!("dispatched loop handler on non-loop step")
        };
        let max_iterations = *max_iterations;
        let loop_strategy = step
            .on_error
            .as_ref()
            .map(|policy| policy.strategy)
            .unwrap_or_default();

        let mut history: Vec<Value> = Vec::new();
        let mut dropped_records = 0usize;
        let mut step_outputs = OutputMap::new();
        let mut iteration_count = 0u32;
        let mut terminated_by = "max_iterations";
        let mut loop_error: Option<StepError> = None;
        let mut usage = TokenUsage::default();
        let mut cost_usd = 0.0;

        for iteration in 0..max_iterations {
            if scope.expired() {
                terminated_by = "timeout";
                loop_error = Some(StepError::Timeout);
                break;
            }
            if scope.cancel.is_cancelled() {
                terminated_by = "error";
                loop_error = Some(StepError::Cancelled);
                break;
            }
            iteration_count = iteration + 1;
            let iteration_start = Instant::now();

            // Iteration context: a private copy with loop variables and
            // the latest nested outputs visible.
            let mut iter_ctx = ctx.clone();
            iter_ctx.loop_scope = Some(LoopScope {
                iteration,
                max_iterations,
                history: history.clone(),
            });
            for (id, value) in &step_outputs {
                iter_ctx.steps.insert(id.clone(), value.clone());
            }

            let mut iteration_error: Option<(String, StepError)> = None;
            for nested in body {
                match self.execute(nested, &iter_ctx, scope).await {
                    Ok(result) if result.status == StepStatus::Skipped => {
                        // Gated out this iteration; nothing recorded.
                    }
                    Ok(result) => {
                        if let Some(step_usage) = &result.token_usage {
                            usage.add(step_usage);
                        }
                        cost_usd += result.cost_usd.unwrap_or(0.0);
                        // A nested step whose error was suppressed by its
                        // own `on_error: ignore` is recorded as a failed
                        // stub; the loop continues.
                        let value = if let Some(error) = &result.error {
                            json!({ "status": "failed", "error": error })
                        } else {
                            Value::Object(result.output)
                        };
                        iter_ctx.steps.insert(nested.id.clone(), value.clone());
                        step_outputs.insert(nested.id.clone(), value);
                    }
                    Err(failure) => {
                        if let Some(step_usage) = &failure.result.token_usage {
                            usage.add(step_usage);
                        }
                        cost_usd += failure.result.cost_usd.unwrap_or(0.0);
                        iteration_error = Some((nested.id.clone(), failure.error));
                        break;
                    }
                }
            }

            let record = json!({
                "iteration": iteration,
                "steps": mask::mask_map(&step_outputs),
                "timestamp": Utc::now().to_rfc3339(),
                "duration_ms": iteration_start.elapsed().as_millis() as u64,
            });
            history.push(record);
            dropped_records += enforce_history_cap(&mut history);

            if let Some((failed_id, error)) = iteration_error {
                if loop_strategy == ErrorStrategy::Ignore {
                    tracing::debug!(
                        step_id = step.id.as_str(),
                        failed_step = failed_id.as_str(),
                        iteration,
                        "swallowing iteration error per loop on_error policy"
                    );
                } else {
                    // The `until` clause is still evaluated after a failed
                    // iteration before the loop terminates.
                    if let Some(until) = until {
                        let _ = self.evaluate_until(until, &iter_ctx);
                    }
                    terminated_by = "error";
                    loop_error = Some(StepError::Nested {
                        step_id: failed_id,
                        message: error.to_string(),
                    });
                    break;
                }
            }

            if let Some(until) = until {
                match self.evaluate_until(until, &iter_ctx) {
                    Ok(true) => {
                        terminated_by = "condition";
                        break;
                    }
                    Ok(false) => {}
                    Err(error) => {
                        terminated_by = "error";
                        loop_error = Some(error);
                        break;
                    }
                }
            }
        }

        let mut output = OutputMap::new();
        output.insert("step_outputs".to_string(), Value::Object(step_outputs));
        output.insert("iteration_count".to_string(), json!(iteration_count));
        output.insert("terminated_by".to_string(), json!(terminated_by));
        if dropped_records > 0 {
            output.insert("history_truncated".to_string(), json!(true));
            output.insert("retained_iterations".to_string(), json!(history.len()));
            output.insert("total_iterations".to_string(), json!(iteration_count));
        }
        output.insert("history".to_string(), Value::Array(history));
        embed_sidebands(&mut output, &usage, cost_usd);

        match loop_error {
            Some(error) => Err(HandlerError::with_partial(output, error)),
            None => Ok(output),
        }
    }

    /// Resolve templates in the `until` string, then evaluate it as a
    /// boolean expression in the iteration context.
    fn evaluate_until(
        &self,
        until: &str,
        iter_ctx: &WorkflowContext,
    ) -> Result<bool, StepError> {
        let template_ctx = iter_ctx.template_context();
        let resolved = template::resolve_str(until, &template_ctx)?;
        expression::evaluate_bool(&resolved, &template_ctx).map_err(StepError::Expression)
    }
}

/// Drop oldest history records until the serialized history fits the cap,
/// always keeping at least one record. Returns how many were dropped.
fn enforce_history_cap(history: &mut Vec<Value>) -> usize {
    let mut dropped = 0;
    while history.len() > 1 && serialized_len(history) > MAX_HISTORY_BYTES {
        history.remove(0);
        dropped += 1;
    }
    if dropped > 0 {
        tracing::warn!(dropped, retained = history.len(), "loop history truncated");
    }
    dropped
}

fn serialized_len(history: &[Value]) -> usize {
    serde_json::to_string(history).map(|s| s.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_cap_keeps_at_least_one_record() {
        let big = "x".repeat(MAX_HISTORY_BYTES);
        let mut history = vec![json!({ "iteration": 0, "blob": big })];
        let dropped = enforce_history_cap(&mut history);
        assert_eq!(dropped, 0);
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn history_cap_drops_oldest_first() {
        let chunk = "y".repeat(MAX_HISTORY_BYTES / 2);
        let mut history = vec![
            json!({ "iteration": 0, "blob": chunk.clone() }),
            json!({ "iteration": 1, "blob": chunk.clone() }),
            json!({ "iteration": 2, "blob": chunk }),
        ];
        let dropped = enforce_history_cap(&mut history);
        assert!(dropped >= 1);
        // The newest record survives.
        let last = history.last().unwrap();
        assert_eq!(last["iteration"], json!(2));
    }
}
