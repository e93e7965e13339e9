//! Optional rewrite of the final answer.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::ExecutionContext;
use crate::llm::{LlmClient, LlmError};
use crate::message::Message;

/// Marker some joiners emit instead of a real answer.
pub const COMPLETION_MARKER: &str = "All tasks completed";

const SUMMARY_SYSTEM: &str = "\
Write the answer to the user's request from the results of the executed actions. \
Use only information present in the results. Be concise.";

/// Runs on `Done` answers before they are returned and saved.
#[async_trait]
pub trait Postprocessor: Send + Sync {
    async fn process(
        &self,
        request: &str,
        answer: &str,
        context: &ExecutionContext,
    ) -> Result<String, LlmError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryPolicy {
    Always,
    /// Only when the answer contains [`COMPLETION_MARKER`].
    OnCompletionMarker,
}

/// Summarizes the execution context into an answer with an [`LlmClient`].
pub struct LlmSummarizer {
    llm: Arc<dyn LlmClient>,
    policy: SummaryPolicy,
}

impl LlmSummarizer {
    pub fn new(llm: Arc<dyn LlmClient>, policy: SummaryPolicy) -> Self {
        Self { llm, policy }
    }

    fn applies_to(&self, answer: &str) -> bool {
        match self.policy {
            SummaryPolicy::Always => true,
            SummaryPolicy::OnCompletionMarker => answer.contains(COMPLETION_MARKER),
        }
    }
}

#[async_trait]
impl Postprocessor for LlmSummarizer {
    async fn process(
        &self,
        request: &str,
        answer: &str,
        context: &ExecutionContext,
    ) -> Result<String, LlmError> {
        if !self.applies_to(answer) {
            return Ok(answer.to_string());
        }
        let user = format!(
            "Request: {}\n\nResults:\n{}\n\nDraft answer: {}",
            request,
            context.render_observations(1),
            answer
        );
        let response = self
            .llm
            .invoke(&[Message::system(SUMMARY_SYSTEM), Message::user(user)])
            .await?;
        Ok(response.content.trim().to_string())
    }
}
