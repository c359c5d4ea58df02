//! LlmProvider trait definition.
//!
//! This is the narrow capability contract the engine holds on LLM
//! backends. Uses native async fn in traits (RPITIT); `BoxLlmProvider`
//! provides the object-safe wrapper for runtime injection.

use baton_types::llm::{CompletionRequest, CompletionResponse, LlmError};

/// Contract for LLM provider backends.
///
/// The engine requests completions by tier; the provider maps the tier to
/// a concrete model and reports it back in the response. A provider that
/// cannot report usage still succeeds; the step then contributes zero to
/// aggregated usage.
pub trait LlmProvider: Send + Sync {
    /// Human-readable provider name (e.g. "anthropic", "mock").
    fn name(&self) -> &str;

    /// Send a completion request and receive the full response.
    fn complete(
        &self,
        request: &CompletionRequest,
    ) -> impl std::future::Future<Output = Result<CompletionResponse, LlmError>> + Send;
}
