//! Plan generation: the source of the text the parser consumes.
//!
//! [`PlanSource::generate`] writes plan text into a bounded channel while the parser reads the
//! other end, so tasks can be scheduled before generation has finished.
//!
//! **Interaction**: Spawned by the [`Compiler`](crate::compiler::Compiler) at the start of
//! every round; aborted when the turn is cancelled.

mod prompt;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::llm::{LlmClient, LlmError};
use crate::message::Message;
use crate::stream::MessageChunk;
use crate::task::TaskIndex;
use crate::tools::ToolSpec;

/// Everything a planner needs for one round.
#[derive(Clone, Debug, PartialEq)]
pub struct PlanRequest {
    pub request: String,
    /// First index the plan must use.
    pub next_index: TaskIndex,
    /// 1-based round within the current turn.
    pub round: u32,
    /// Replan feedback of this turn, oldest first.
    pub feedback: Vec<String>,
    /// Rendered results of earlier tasks (`index. tool(args) -> result` lines).
    pub observations: String,
    pub tools: Vec<ToolSpec>,
}

impl PlanRequest {
    /// An earlier round of this turn fell short.
    pub fn is_replan(&self) -> bool {
        !self.feedback.is_empty()
    }

    /// Earlier tasks exist on the thread, from this turn or a previous one.
    pub fn continues_numbering(&self) -> bool {
        self.next_index > 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanSourceError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("plan source failed: {0}")]
    Other(String),
}

/// Produces plan text as a stream of chunks.
///
/// Implementations return once the plan is complete or once `chunks` is closed by the reader.
#[async_trait]
pub trait PlanSource: Send + Sync {
    async fn generate(
        &self,
        request: PlanRequest,
        chunks: mpsc::Sender<MessageChunk>,
    ) -> Result<(), PlanSourceError>;
}

/// Streams a plan from an [`LlmClient`].
pub struct LlmPlanSource {
    llm: Arc<dyn LlmClient>,
}

impl LlmPlanSource {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// System + user messages for one planning call.
    pub fn messages(&self, request: &PlanRequest) -> Vec<Message> {
        let tool_descriptions: Vec<String> = request
            .tools
            .iter()
            .enumerate()
            .map(|(i, spec)| format!("{}. {}", i + 1, spec.describe()))
            .collect();
        let system = prompt::PLANNER_SYSTEM
            .replace("{num_tools}", &(request.tools.len() + 1).to_string())
            .replace("{tool_descriptions}", &tool_descriptions.join("\n"));

        let mut user = format!("Request: {}", request.request);
        if !request.observations.is_empty() {
            user.push_str("\n\nResults so far:\n");
            user.push_str(&request.observations);
        }
        for feedback in &request.feedback {
            user.push_str("\n\n");
            user.push_str(prompt::FEEDBACK_HEADER);
            user.push(' ');
            user.push_str(feedback);
        }
        if request.is_replan() {
            user.push_str("\n\n");
            user.push_str(prompt::REPLAN_INSTRUCTIONS);
        }
        if request.continues_numbering() {
            user.push_str("\n\n");
            user.push_str(
                &prompt::CONTINUE_NUMBERING
                    .replace("{next_index}", &request.next_index.to_string()),
            );
        }
        vec![Message::system(system), Message::user(user)]
    }
}

#[async_trait]
impl PlanSource for LlmPlanSource {
    async fn generate(
        &self,
        request: PlanRequest,
        chunks: mpsc::Sender<MessageChunk>,
    ) -> Result<(), PlanSourceError> {
        tracing::debug!(round = request.round, next_index = request.next_index, "requesting plan");
        let messages = self.messages(&request);
        self.llm.invoke_stream(&messages, Some(chunks)).await?;
        Ok(())
    }
}
