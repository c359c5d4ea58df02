//! Sub-workflow step handler.
//!
//! Loads the child definition through the injected loader, reconciles the
//! caller-supplied inputs against the child's declarations (defaults
//! filled, missing-required rejected before any child step runs), and
//! executes the child's steps sequentially under a fresh executor that
//! shares the parent's collaborators and fan-out width. Declared outputs
//! are extracted with the template resolver; errors are wrapped with a
//! breadcrumb of the failing path and the child trace id.

use serde_json::{Value, json};
use uuid::Uuid;

use baton_types::error::ValidationError;
use baton_types::llm::TokenUsage;
use baton_types::workflow::{StepConfig, StepDefinition};

use crate::context::WorkflowContext;
use crate::definition;
use crate::executor::{
    CHILD_TRACE_KEY, ExecScope, HandlerError, HandlerResult, OutputMap, StepError, StepExecutor,
    embed_sidebands,
};
use crate::template;

impl StepExecutor {
    pub(crate) async fn run_subworkflow(
        &self,
        step: &StepDefinition,
        ctx: &WorkflowContext,
        scope: &ExecScope,
    ) -> HandlerResult {
        let StepConfig::Workflow { workflow, inputs } = &step.config else {
            unreachable!("dispatched workflow handler on non-workflow step")
        };
        let loader = self.loader.as_ref().ok_or_else(|| {
            baton_types::error::ConfigError::new(
                "subworkflow_loader",
                "no sub-workflow loader configured",
            )
        })?;
        let parent_dir = self.workflow_dir.as_ref().ok_or_else(|| {
            baton_types::error::ConfigError::new(
                "workflow_dir",
                "no workflow directory configured for sub-workflow resolution",
            )
        })?;

        // Recursion guard: fail when the child path is already on the
        // current sub-workflow chain.
        let child_path = parent_dir.join(workflow);
        if scope.visited.contains(&child_path) {
            return Err(ValidationError::new(
                format!("steps.{}.workflow", step.id),
                format!("recursive sub-workflow reference to '{workflow}'"),
            )
            .into());
        }

        let child = loader
            .load(parent_dir, workflow)
            .map_err(|err| HandlerError::new(StepError::Failed(err.to_string())))?;
        let child_trace_id = Uuid::now_v7().to_string();

        tracing::debug!(
            step_id = step.id.as_str(),
            child = child.name.as_str(),
            child_trace_id = child_trace_id.as_str(),
            "executing sub-workflow"
        );

        // Resolve templates in the caller-supplied inputs against the
        // parent context, then reconcile against the child's declarations.
        let template_ctx = ctx.template_context();
        let resolved = template::resolve_inputs(&Value::Object(inputs.clone()), &template_ctx)?;
        let Value::Object(resolved) = resolved else {
            unreachable!("resolving an object yields an object")
        };
        let child_inputs = definition::reconcile_inputs(&child, resolved)?;

        // Fresh executor sharing the parent's collaborators, limits, and
        // fan-out width; the workflow directory moves to the child's for
        // nested resolution.
        let child_dir = child_path
            .parent()
            .map(std::path::Path::to_path_buf)
            .unwrap_or_else(|| parent_dir.clone());
        let mut child_executor = self.clone();
        child_executor.workflow_name = child.name.clone();
        child_executor.workflow_dir = Some(child_dir);
        child_executor.agents = std::sync::Arc::new(child.agents.clone());

        let child_scope = scope.entering_workflow(child_path);
        let mut child_ctx = WorkflowContext::with_env(
            child.name.clone(),
            self.run_id,
            child_inputs,
            ctx.env.clone(),
        );

        let mut usage = TokenUsage::default();
        let mut cost_usd = 0.0;

        for child_step in &child.steps {
            match child_executor
                .execute(child_step, &child_ctx, &child_scope)
                .await
            {
                Ok(result) => {
                    if let Some(step_usage) = &result.token_usage {
                        usage.add(step_usage);
                    }
                    cost_usd += result.cost_usd.unwrap_or(0.0);
                    if result.status != baton_types::workflow::StepStatus::Skipped {
                        if let Err(err) = child_ctx
                            .insert_step_output(&child_step.id, Value::Object(result.output))
                        {
                            return Err(self.child_failure(
                                step,
                                &child.name,
                                &child_step.id,
                                &child_trace_id,
                                usage,
                                cost_usd,
                                err.to_string(),
                            ));
                        }
                    }
                }
                Err(failure) => {
                    if let Some(step_usage) = &failure.result.token_usage {
                        usage.add(step_usage);
                    }
                    cost_usd += failure.result.cost_usd.unwrap_or(0.0);
                    return Err(self.child_failure(
                        step,
                        &child.name,
                        &child_step.id,
                        &child_trace_id,
                        usage,
                        cost_usd,
                        failure.error.to_string(),
                    ));
                }
            }
        }

        // Extract the child's declared outputs from its final context.
        let child_template_ctx = child_ctx.template_context();
        let mut output = OutputMap::new();
        for declaration in &child.outputs {
            let value = template::resolve_typed(&declaration.value, &child_template_ctx)?;
            output.insert(declaration.name.clone(), value);
        }
        output.insert(CHILD_TRACE_KEY.to_string(), json!(child_trace_id));
        embed_sidebands(&mut output, &usage, cost_usd);
        Ok(output)
    }

    /// Wrap a failing child step into a breadcrumb error:
    /// `<parent_step_id> → <child_workflow_name> → <failing_step_id>
    /// (trace: <id>): <underlying>`.
    #[allow(clippy::too_many_arguments)]
    fn child_failure(
        &self,
        step: &StepDefinition,
        child_name: &str,
        failing_step_id: &str,
        child_trace_id: &str,
        usage: TokenUsage,
        cost_usd: f64,
        message: String,
    ) -> HandlerError {
        let breadcrumb = format!(
            "{} → {} → {} (trace: {}): {}",
            step.id, child_name, failing_step_id, child_trace_id, message
        );
        let mut partial = OutputMap::new();
        partial.insert(CHILD_TRACE_KEY.to_string(), json!(child_trace_id));
        embed_sidebands(&mut partial, &usage, cost_usd);
        HandlerError::with_partial(partial, StepError::Subworkflow(breadcrumb))
    }
}
