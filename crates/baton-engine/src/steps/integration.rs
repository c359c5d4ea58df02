//! Integration step handler.
//!
//! Resolves the operation reference (`integration: "name.operation"` or
//! `action` + `operation`), recursively resolves templates in the inputs,
//! and delegates to the operation registry. The primary response lands at
//! `response`; map responses are additionally flattened to the top level
//! so `shell.run`'s `{stdout, stderr, exit_code}` is directly accessible,
//! and string responses are mirrored at `content`.
//!
//! Inputs are logged with sensitive keys masked.

use serde_json::{Value, json};

use baton_types::error::ConfigError;
use baton_types::workflow::{StepConfig, StepDefinition};

use crate::context::WorkflowContext;
use crate::executor::{HandlerError, HandlerResult, OutputMap, StepError, StepExecutor};
use crate::mask;
use crate::template;

impl StepExecutor {
    pub(crate) async fn run_integration(
        &self,
        step: &StepDefinition,
        ctx: &WorkflowContext,
    ) -> HandlerResult {
        let StepConfig::Integration {
            integration,
            action,
            operation,
            inputs,
        } = &step.config
        else {
            unreachable!("dispatched integration handler on non-integration step")
        };

        let reference = match (integration, action, operation) {
            (Some(reference), _, _) => {
                if !reference.contains('.') {
                    return Err(ConfigError::new(
                        "integration",
                        format!("integration reference '{reference}' must be 'name.operation'"),
                    )
                    .into());
                }
                reference.clone()
            }
            (None, Some(action), Some(operation)) => format!("{action}.{operation}"),
            _ => {
                return Err(ConfigError::new(
                    "integration",
                    "integration step requires `integration` or `action` + `operation`",
                )
                .into());
            }
        };

        let registry = self.operations.as_ref().ok_or_else(|| {
            ConfigError::new("operation_registry", "no operation registry configured")
        })?;

        let template_ctx = ctx.template_context();
        let resolved = template::resolve_inputs(&Value::Object(inputs.clone()), &template_ctx)?;
        let Value::Object(resolved) = resolved else {
            unreachable!("resolving an object yields an object")
        };

        let masked_inputs = Value::Object(mask::mask_map(&resolved));
        tracing::debug!(
            step_id = step.id.as_str(),
            operation = reference.as_str(),
            inputs = %masked_inputs,
            "executing integration operation"
        );

        let result = registry
            .execute(&reference, &resolved)
            .await
            .map_err(|err| HandlerError::new(StepError::Operation(err)))?;

        let Some(result) = result else {
            return Err(HandlerError::new(StepError::Contract(format!(
                "operation '{reference}' returned neither a result nor an error"
            ))));
        };

        let mut output = OutputMap::new();
        match &result.response {
            Value::Object(map) => {
                for (key, value) in map {
                    output.insert(key.clone(), value.clone());
                }
            }
            Value::String(text) => {
                output.insert("content".to_string(), json!(text));
            }
            _ => {}
        }
        output.insert("response".to_string(), result.response.clone());
        if let Some(metadata) = result.metadata {
            output.insert("metadata".to_string(), metadata);
        }
        if let Some(status_code) = result.status_code {
            if status_code > 0 {
                output.insert("status_code".to_string(), json!(status_code));
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecScope;
    use crate::registry::{OperationRegistry, OperationResult};
    use crate::tracker::InMemoryCostTracker;
    use baton_types::workflow::StepStatus;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Arc;
    use uuid::Uuid;

    struct FakeOperations;

    impl OperationRegistry for FakeOperations {
        fn execute<'a>(
            &'a self,
            operation: &'a str,
            inputs: &'a serde_json::Map<String, Value>,
        ) -> Pin<
            Box<dyn Future<Output = Result<Option<OperationResult>, anyhow::Error>> + Send + 'a>,
        > {
            Box::pin(async move {
                match operation {
                    "shell.run" => Ok(Some(OperationResult {
                        response: json!({
                            "stdout": format!("ran: {}", inputs["command"].as_str().unwrap()),
                            "stderr": "",
                            "exit_code": 0
                        }),
                        raw_response: None,
                        status_code: None,
                        metadata: None,
                    })),
                    "http.get" => Ok(Some(OperationResult {
                        response: json!("body text"),
                        raw_response: Some("body text".to_string()),
                        status_code: Some(200),
                        metadata: Some(json!({"content_type": "text/plain"})),
                    })),
                    "broken.contract" => Ok(None),
                    other => Err(anyhow::anyhow!("unknown operation '{other}'")),
                }
            })
        }
    }

    fn executor() -> StepExecutor {
        StepExecutor::new("test-wf", Uuid::now_v7(), Arc::new(InMemoryCostTracker::new()))
            .with_operations(Arc::new(FakeOperations))
    }

    fn integration_step(id: &str, reference: &str, inputs: serde_json::Map<String, Value>) -> StepDefinition {
        StepDefinition {
            id: id.to_string(),
            condition: None,
            timeout: None,
            retry: None,
            on_error: None,
            max_tokens: None,
            max_cost: None,
            permissions: None,
            config: StepConfig::Integration {
                integration: Some(reference.to_string()),
                action: None,
                operation: None,
                inputs,
            },
        }
    }

    fn test_ctx() -> WorkflowContext {
        let mut ctx = WorkflowContext::with_env(
            "test-wf",
            Uuid::now_v7(),
            serde_json::Map::new(),
            serde_json::Map::new(),
        );
        ctx.insert_step_output("prep", json!({"response": "cargo test"}))
            .unwrap();
        ctx
    }

    #[tokio::test]
    async fn map_responses_flatten_to_top_level() {
        let executor = executor();
        let inputs = serde_json::Map::from_iter([(
            "command".to_string(),
            json!("{{.steps.prep.response}}"),
        )]);
        let step = integration_step("lint", "shell.run", inputs);

        let result = executor
            .execute(&step, &test_ctx(), &ExecScope::new())
            .await
            .unwrap();
        assert_eq!(result.status, StepStatus::Success);
        // Templates resolved in inputs; map keys flattened to the top.
        assert_eq!(result.output["stdout"], json!("ran: cargo test"));
        assert_eq!(result.output["exit_code"], json!(0));
        assert_eq!(result.output["response"]["stdout"], json!("ran: cargo test"));
    }

    #[tokio::test]
    async fn string_responses_are_mirrored_at_content() {
        let executor = executor();
        let step = integration_step("fetch", "http.get", serde_json::Map::new());

        let result = executor
            .execute(&step, &test_ctx(), &ExecScope::new())
            .await
            .unwrap();
        assert_eq!(result.output["content"], json!("body text"));
        assert_eq!(result.output["response"], json!("body text"));
        assert_eq!(result.output["status_code"], json!(200));
        assert_eq!(result.output["metadata"]["content_type"], json!("text/plain"));
    }

    #[tokio::test]
    async fn nil_nil_is_a_contract_violation() {
        let executor = executor();
        let step = integration_step("broken", "broken.contract", serde_json::Map::new());

        let failure = executor
            .execute(&step, &test_ctx(), &ExecScope::new())
            .await
            .unwrap_err();
        assert!(matches!(failure.error, StepError::Contract(_)));
        assert!(failure.result.error.as_ref().unwrap().contains("contract"));
    }

    #[tokio::test]
    async fn action_operation_pair_forms_the_reference() {
        let executor = executor();
        let step = StepDefinition {
            id: "fetch".to_string(),
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
        let result = executor
            .execute(&step, &test_ctx(), &ExecScope::new())
            .await
            .unwrap();
        assert_eq!(result.output["status_code"], json!(200));
    }

    #[tokio::test]
    async fn missing_reference_is_a_config_error() {
        let executor = executor();
        let step = StepDefinition {
            id: "bad".to_string(),
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
                operation: None,
                inputs: serde_json::Map::new(),
            },
        };
        let failure = executor
            .execute(&step, &test_ctx(), &ExecScope::new())
            .await
            .unwrap_err();
        assert!(matches!(failure.error, StepError::Config(_)));
    }

    #[tokio::test]
    async fn registry_errors_surface_as_operation_errors() {
        let executor = executor();
        let step = integration_step("nope", "unknown.op", serde_json::Map::new());
        let failure = executor
            .execute(&step, &test_ctx(), &ExecScope::new())
            .await
            .unwrap_err();
        assert!(matches!(failure.error, StepError::Operation(_)));
    }
}
