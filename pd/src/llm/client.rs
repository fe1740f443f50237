//! LlmClient trait definition

use async_trait::async_trait;

use super::{CompletionRequest, CompletionResponse, LlmError};

/// Text-in/text-out reasoning service
///
/// Implementations may be stateless per call or keep an opaque server-side
/// conversation (returned in [`CompletionResponse::conversation`]). Retrying
/// is the caller's job; clients report failures as-is.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a single completion request
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;
}
