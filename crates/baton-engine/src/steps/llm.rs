//! LLM and agent step handlers.
//!
//! Both resolve templates in the prompt and system text, assemble a
//! completion request with attribution fields, and either perform a single
//! completion or delegate to the structured-output pipeline when an
//! `output_schema` is declared. Usage is appended to the cost tracker so
//! limit enforcement observes it, including for failed structured steps.

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use baton_types::cost::CostRecord;
use baton_types::error::ConfigError;
use baton_types::llm::{CompletionRequest, TokenUsage, ToolDescriptor};
use baton_types::workflow::{ModelTier, StepConfig, StepDefinition};

use crate::context::WorkflowContext;
use crate::executor::{
    HandlerError, HandlerResult, OutputMap, StepError, StepExecutor, embed_sidebands,
};
use crate::pricing;
use crate::schema::{self, StructuredError};
use crate::template;

impl StepExecutor {
    pub(crate) async fn run_llm(
        &self,
        step: &StepDefinition,
        ctx: &WorkflowContext,
    ) -> HandlerResult {
        let StepConfig::Llm {
            prompt,
            system,
            model,
            tools,
            output_schema,
        } = &step.config
        else {
            unreachable!("dispatched llm handler on non-llm step")
        };
        self.complete_step(
            step,
            ctx,
            prompt,
            system.as_deref(),
            model.unwrap_or_default(),
            tools,
            output_schema.as_ref(),
        )
        .await
    }

    pub(crate) async fn run_agent(
        &self,
        step: &StepDefinition,
        ctx: &WorkflowContext,
    ) -> HandlerResult {
        let StepConfig::Agent {
            agent,
            prompt,
            output_schema,
        } = &step.config
        else {
            unreachable!("dispatched agent handler on non-agent step")
        };
        let definition = self
            .agents
            .get(agent)
            .ok_or_else(|| ConfigError::new(format!("agents.{agent}"), "agent is not defined"))?
            .clone();
        self.complete_step(
            step,
            ctx,
            prompt,
            definition.system.as_deref(),
            definition.model.unwrap_or_default(),
            &definition.tools,
            output_schema.as_ref(),
        )
        .await
    }

    /// Shared completion path for llm and agent steps.
    #[allow(clippy::too_many_arguments)]
    async fn complete_step(
        &self,
        step: &StepDefinition,
        ctx: &WorkflowContext,
        prompt: &str,
        system: Option<&str>,
        tier: ModelTier,
        tool_names: &[String],
        output_schema: Option<&Value>,
    ) -> HandlerResult {
        let provider = self
            .provider
            .as_ref()
            .ok_or_else(|| ConfigError::new("llm_provider", "no LLM provider configured"))?;

        let template_ctx = ctx.template_context();
        let prompt = template::resolve_str(prompt, &template_ctx)?;
        let system = system
            .map(|text| template::resolve_str(text, &template_ctx))
            .transpose()?;

        let request = CompletionRequest {
            prompt,
            system,
            model: tier,
            tools: self.visible_tools(tool_names),
            run_id: Some(self.run_id),
            workflow_id: Some(self.workflow_name.clone()),
            step_name: Some(step.id.clone()),
            extra: serde_json::Map::new(),
        };

        if let Some(schema) = output_schema {
            let outcome = self
                .guard_with_monitor(schema::complete_structured(provider, &request, schema))
                .await
                .map_err(HandlerError::new)?;
            return self.shape_structured_outcome(outcome, tier);
        }

        let response = self
            .guard_with_monitor(provider.complete(&request))
            .await
            .map_err(HandlerError::new)?
            .map_err(|err| HandlerError::new(StepError::Llm(err)))?;

        let mut output = OutputMap::new();
        output.insert("response".to_string(), json!(response.content));
        if let Some(usage) = &response.usage {
            let cost_usd = response
                .cost_usd
                .unwrap_or_else(|| pricing::estimate_cost(usage, tier));
            self.track_usage(&response.model, usage, cost_usd);
            embed_sidebands(&mut output, usage, cost_usd);
        }
        Ok(output)
    }

    /// Run a provider interaction with the best-effort streaming limit
    /// monitor alongside it. When the monitor trips, the in-flight call
    /// is dropped and the limit error wins.
    async fn guard_with_monitor<T>(
        &self,
        interaction: impl std::future::Future<Output = T>,
    ) -> Result<T, StepError> {
        let Some(enforcer) = &self.enforcer else {
            return Ok(interaction.await);
        };
        let monitor_cancel = CancellationToken::new();
        let mut monitor = enforcer.spawn_streaming_monitor(monitor_cancel.clone());
        tokio::pin!(interaction);
        let outcome = tokio::select! {
            value = &mut interaction => Ok(value),
            tripped = &mut monitor => match tripped {
                Ok(Some(limit)) => Err(StepError::Limit(limit)),
                // Monitor ended without tripping; finish the call.
                _ => Ok((&mut interaction).await),
            }
        };
        monitor_cancel.cancel();
        monitor.abort();
        outcome
    }

    fn shape_structured_outcome(
        &self,
        outcome: Result<schema::StructuredCompletion, StructuredError>,
        tier: ModelTier,
    ) -> HandlerResult {
        match outcome {
            Ok(completion) => {
                self.track_usage(&completion.model, &completion.usage, completion.cost_usd);
                let mut output = OutputMap::new();
                output.insert("output".to_string(), completion.output);
                output.insert("response".to_string(), json!(completion.raw_response));
                output.insert("attempts".to_string(), json!(completion.attempts));
                embed_sidebands(&mut output, &completion.usage, completion.cost_usd);
                Ok(output)
            }
            Err(StructuredError::Schema(failure)) => {
                self.track_usage(&format!("tier:{}", tier.as_str()), &failure.usage, failure.cost_usd);
                let mut partial = OutputMap::new();
                partial.insert(
                    "response".to_string(),
                    json!(failure.violation.actual_response.clone()),
                );
                partial.insert("attempts".to_string(), json!(failure.violation.attempts));
                embed_sidebands(&mut partial, &failure.usage, failure.cost_usd);
                Err(HandlerError::with_partial(
                    partial,
                    StepError::from(failure.violation),
                ))
            }
            Err(StructuredError::Provider {
                source,
                usage,
                cost_usd,
            }) => {
                self.track_usage(&format!("tier:{}", tier.as_str()), &usage, cost_usd);
                let mut partial = OutputMap::new();
                embed_sidebands(&mut partial, &usage, cost_usd);
                Err(HandlerError::with_partial(partial, StepError::Llm(source)))
            }
        }
    }

    /// Filter requested tool names against the registry; unknown names are
    /// dropped with a debug note.
    fn visible_tools(&self, tool_names: &[String]) -> Vec<ToolDescriptor> {
        let Some(registry) = &self.tools else {
            if !tool_names.is_empty() {
                tracing::debug!("tools requested but no tool registry configured");
            }
            return Vec::new();
        };
        tool_names
            .iter()
            .filter_map(|name| {
                let descriptor = registry.get(name);
                if descriptor.is_none() {
                    tracing::debug!(tool = name.as_str(), "tool not in registry, dropping");
                }
                descriptor
            })
            .collect()
    }

    /// Append a cost record for this run. No-op when the provider reported
    /// no usage: such completions contribute zero to aggregation.
    fn track_usage(&self, model: &str, usage: &TokenUsage, cost_usd: f64) {
        if usage.is_zero() {
            return;
        }
        let provider_name = self
            .provider
            .as_ref()
            .map(|provider| provider.name().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        self.tracker.track(CostRecord {
            run_id: self.run_id,
            provider: provider_name,
            model: model.to_string(),
            usage: *usage,
            cost_usd: Some(cost_usd),
        });
    }
}
