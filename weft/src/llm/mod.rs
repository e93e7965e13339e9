//! LLM client abstraction used by the planner, the joiner and the summarizer.
//!
//! # Streaming Support
//!
//! [`LlmClient::invoke_stream`] accepts an optional `Sender<MessageChunk>` for emitting text as
//! it arrives. [`ChatOpenAI`] streams over server-sent events; [`MockLlm`] splits its scripted
//! reply into chunks. Clients without streaming fall back to the default implementation, which
//! sends the whole reply as one chunk.

mod mock;
mod openai;

pub use mock::MockLlm;
pub use openai::ChatOpenAI;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::message::Message;
use crate::stream::MessageChunk;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LlmError {
    #[error("llm request failed: {0}")]
    Request(String),
    #[error("llm returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("llm response malformed: {0}")]
    Decode(String),
    #[error("llm configuration: {0}")]
    Config(String),
    #[error("mock llm has no scripted reply left")]
    Exhausted,
}

/// Token usage for one call.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LlmUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Full reply of one completion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LlmResponse {
    pub content: String,
    pub usage: Option<LlmUsage>,
}

/// LLM client: given messages, returns the assistant reply.
///
/// **Interaction**: Used by [`LlmPlanSource`](crate::planner::LlmPlanSource) (streaming),
/// [`LlmDecisionSource`](crate::joiner::LlmDecisionSource) and
/// [`LlmSummarizer`](crate::compiler::LlmSummarizer).
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn invoke(&self, messages: &[Message]) -> Result<LlmResponse, LlmError>;

    /// Streaming variant. When `chunk_tx` is `Some`, text is sent through it as it arrives;
    /// the complete reply is still returned at the end. Implementations stop early when the
    /// receiver is dropped.
    ///
    /// Default implementation calls `invoke()` and sends the full content as one chunk.
    async fn invoke_stream(
        &self,
        messages: &[Message],
        chunk_tx: Option<mpsc::Sender<MessageChunk>>,
    ) -> Result<LlmResponse, LlmError> {
        let response = self.invoke(messages).await?;
        if let Some(tx) = chunk_tx {
            if !response.content.is_empty() {
                let _ = tx.send(MessageChunk::new(response.content.clone())).await;
            }
        }
        Ok(response)
    }
}
