//! Tool and operation registry contracts.
//!
//! Both registries are injected into the executor as trait objects; their
//! methods return boxed futures so the traits stay object-safe. Errors
//! from the collaborators are opaque (`anyhow::Error`); the engine wraps
//! them into step failures.

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use baton_types::llm::ToolDescriptor;

/// Result of one operation registry call.
///
/// `response` is the primary payload the integration handler shapes into
/// the step output; `status_code` is surfaced when positive.
#[derive(Debug, Clone, Default)]
pub struct OperationResult {
    pub response: Value,
    pub raw_response: Option<String>,
    pub status_code: Option<u16>,
    pub metadata: Option<Value>,
}

/// Registry of tools visible to LLM steps.
pub trait ToolRegistry: Send + Sync {
    /// Look up one tool descriptor by name.
    fn get(&self, name: &str) -> Option<ToolDescriptor>;

    /// All registered tool descriptors.
    fn list_tools(&self) -> Vec<ToolDescriptor>;

    /// Execute a tool with the given inputs.
    fn execute<'a>(
        &'a self,
        name: &'a str,
        inputs: &'a serde_json::Map<String, Value>,
    ) -> Pin<
        Box<
            dyn Future<Output = Result<serde_json::Map<String, Value>, anyhow::Error>>
                + Send
                + 'a,
        >,
    >;
}

/// Registry of integration operations, addressed as `"name.operation"`.
///
/// Returning `Ok(None)` -- no result and no error -- violates the contract
/// and is raised by the engine as an internal error, never retried.
pub trait OperationRegistry: Send + Sync {
    fn execute<'a>(
        &'a self,
        operation: &'a str,
        inputs: &'a serde_json::Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<OperationResult>, anyhow::Error>> + Send + 'a>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    struct StaticRegistry;

    impl OperationRegistry for StaticRegistry {
        fn execute<'a>(
            &'a self,
            operation: &'a str,
            _inputs: &'a serde_json::Map<String, Value>,
        ) -> Pin<
            Box<dyn Future<Output = Result<Option<OperationResult>, anyhow::Error>> + Send + 'a>,
        > {
            Box::pin(async move {
                match operation {
                    "shell.run" => Ok(Some(OperationResult {
                        response: json!({"stdout": "ok", "stderr": "", "exit_code": 0}),
                        raw_response: None,
                        status_code: None,
                        metadata: None,
                    })),
                    "bad.contract" => Ok(None),
                    other => Err(anyhow::anyhow!("unknown operation '{other}'")),
                }
            })
        }
    }

    #[tokio::test]
    async fn operation_registry_dispatch() {
        let registry: Arc<dyn OperationRegistry> = Arc::new(StaticRegistry);
        let inputs = serde_json::Map::new();

        let result = registry.execute("shell.run", &inputs).await.unwrap();
        assert_eq!(result.unwrap().response["stdout"], json!("ok"));

        let violation = registry.execute("bad.contract", &inputs).await.unwrap();
        assert!(violation.is_none());

        assert!(registry.execute("nope.op", &inputs).await.is_err());
    }
}
