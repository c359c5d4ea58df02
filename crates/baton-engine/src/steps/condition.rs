//! Condition step handler: if/else branching into nested steps.
//!
//! The step's `condition.expression` selects the branch; the chosen
//! branch's steps run sequentially against a private copy of the context,
//! threading each nested output into the next step. Nested outputs are
//! keyed by step id in the returned map alongside `condition_result` and
//! `branch`.

use serde_json::{Value, json};

use baton_types::error::ValidationError;
use baton_types::llm::TokenUsage;
use baton_types::workflow::{StepConfig, StepDefinition};

use crate::context::WorkflowContext;
use crate::executor::{
    ExecScope, HandlerError, HandlerResult, OutputMap, StepError, StepExecutor, embed_sidebands,
};
use crate::expression;

impl StepExecutor {
    pub(crate) async fn run_condition(
        &self,
        step: &StepDefinition,
        ctx: &WorkflowContext,
        scope: &ExecScope,
    ) -> HandlerResult {
        let StepConfig::Condition {
            then_steps,
            else_steps,
        } = &step.config
        else {
            unreachable!("dispatched condition handler on non-condition step")
        };
        let expression_text = step
            .condition
            .as_ref()
            .map(|condition| condition.expression.as_str())
            .ok_or_else(|| {
                ValidationError::new(
                    format!("steps.{}.condition", step.id),
                    "condition step requires condition.expression",
                )
            })?;

        let condition_met = expression::evaluate_bool(expression_text, &ctx.template_context())?;
        let (branch_name, branch) = if condition_met {
            ("then", then_steps)
        } else {
            ("else", else_steps)
        };
        tracing::debug!(
            step_id = step.id.as_str(),
            result = condition_met,
            branch = branch_name,
            "condition branch selected"
        );

        let mut output = OutputMap::new();
        output.insert("condition_result".to_string(), json!(condition_met));
        output.insert("branch".to_string(), json!(branch_name));

        let mut branch_ctx = ctx.clone();
        let mut usage = TokenUsage::default();
        let mut cost_usd = 0.0;

        for nested in branch {
            match self.execute(nested, &branch_ctx, scope).await {
                Ok(result) => {
                    if let Some(step_usage) = &result.token_usage {
                        usage.add(step_usage);
                    }
                    cost_usd += result.cost_usd.unwrap_or(0.0);
                    let value = Value::Object(result.output);
                    output.insert(nested.id.clone(), value.clone());
                    if let Err(err) = branch_ctx.insert_step_output(&nested.id, value) {
                        embed_sidebands(&mut output, &usage, cost_usd);
                        return Err(HandlerError::with_partial(
                            output,
                            StepError::Failed(err.to_string()),
                        ));
                    }
                }
                Err(failure) => {
                    if let Some(step_usage) = &failure.result.token_usage {
                        usage.add(step_usage);
                    }
                    cost_usd += failure.result.cost_usd.unwrap_or(0.0);
                    if !failure.result.output.is_empty() {
                        output.insert(nested.id.clone(), Value::Object(failure.result.output));
                    }
                    embed_sidebands(&mut output, &usage, cost_usd);
                    return Err(HandlerError::with_partial(
                        output,
                        StepError::Nested {
                            step_id: nested.id.clone(),
                            message: failure.error.to_string(),
                        },
                    ));
                }
            }
        }

        embed_sidebands(&mut output, &usage, cost_usd);
        Ok(output)
    }
}
