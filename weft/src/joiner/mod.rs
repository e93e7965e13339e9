//! Join step: turns a round's results into a final answer or a replan request.
//!
//! The [`DecisionSource`] returns raw `{reasoning, action}` output; [`Joiner`] validates it,
//! retries malformed output, and attaches the continuation index to replans so the next
//! round never depends on the model's own numbering.

mod prompt;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::context::{ContextEntry, ExecutionContext};
use crate::llm::LlmClient;
use crate::message::Message;
use crate::task::TaskIndex;
use crate::tools::extract_json;

/// Input of one join.
#[derive(Debug, Clone)]
pub struct JoinRequest<'a> {
    pub request: &'a str,
    /// Everything recorded so far, this round included.
    pub context: &'a ExecutionContext,
    pub round: u32,
    /// Indices handed out in this round, join included.
    pub round_indices: Vec<TaskIndex>,
    /// Replan feedback of earlier rounds, oldest first.
    pub feedback_history: &'a [String],
}

impl JoinRequest<'_> {
    /// One past the highest index used so far.
    pub fn next_index(&self) -> TaskIndex {
        let round_max = self.round_indices.iter().max().copied();
        round_max.max(self.context.max_index()).map_or(1, |i| i + 1)
    }

    fn first_round_index(&self) -> Option<TaskIndex> {
        self.round_indices.iter().min().copied()
    }
}

/// What the decision source proposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinAction {
    Final { response: String },
    Replan { feedback: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawJoinOutput {
    pub reasoning: String,
    pub action: JoinAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinDecision {
    Final { text: String },
    Replan { feedback: String, next_index: TaskIndex },
}

impl JoinDecision {
    pub fn is_replan(&self) -> bool {
        matches!(self, Self::Replan { .. })
    }
}

/// A validated decision and the reasoning that preceded it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub reasoning: String,
    pub decision: JoinDecision,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinDecisionError {
    #[error("malformed join decision: {0}")]
    Malformed(String),
    #[error("join decision source failed: {0}")]
    Source(String),
}

/// Produces the raw decision for a join.
///
/// `previous_error` is set when the joiner retries after a rejected decision.
#[async_trait]
pub trait DecisionSource: Send + Sync {
    async fn decide(
        &self,
        request: &JoinRequest<'_>,
        previous_error: Option<&JoinDecisionError>,
    ) -> Result<RawJoinOutput, JoinDecisionError>;
}

/// Validates decisions and retries a bad one.
pub struct Joiner {
    source: Arc<dyn DecisionSource>,
    max_attempts: usize,
}

impl Joiner {
    pub fn new(source: Arc<dyn DecisionSource>) -> Self {
        Self {
            source,
            max_attempts: 2,
        }
    }

    /// Total attempts per join, first call included. At least one.
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub async fn join(&self, request: &JoinRequest<'_>) -> Result<JoinOutcome, JoinDecisionError> {
        let mut last_error = None;
        for attempt in 1..=self.max_attempts {
            let result = self
                .source
                .decide(request, last_error.as_ref())
                .await
                .and_then(|raw| self.validate(raw, request));
            match result {
                Ok(outcome) => {
                    tracing::info!(
                        round = request.round,
                        replan = outcome.decision.is_replan(),
                        "join decided"
                    );
                    return Ok(outcome);
                }
                Err(e) => {
                    tracing::warn!(round = request.round, attempt, error = %e, "join decision rejected");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| JoinDecisionError::Malformed("no attempt made".into())))
    }

    fn validate(
        &self,
        raw: RawJoinOutput,
        request: &JoinRequest<'_>,
    ) -> Result<JoinOutcome, JoinDecisionError> {
        let reasoning = raw.reasoning.trim().to_string();
        if reasoning.is_empty() {
            return Err(JoinDecisionError::Malformed("reasoning is empty".into()));
        }
        let decision = match raw.action {
            JoinAction::Final { response } if response.trim().is_empty() => {
                return Err(JoinDecisionError::Malformed("final answer is empty".into()))
            }
            JoinAction::Replan { feedback } if feedback.trim().is_empty() => {
                return Err(JoinDecisionError::Malformed("replan feedback is empty".into()))
            }
            JoinAction::Final { response } => JoinDecision::Final { text: response },
            JoinAction::Replan { feedback } => JoinDecision::Replan {
                feedback,
                next_index: request.next_index(),
            },
        };
        Ok(JoinOutcome {
            reasoning,
            decision,
        })
    }
}

#[derive(Deserialize)]
struct WireDecision {
    #[serde(alias = "reasoning")]
    thought: String,
    action: WireAction,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireAction {
    Final { response: String },
    Replan { feedback: String },
}

/// Parses `{"thought": .., "action": {"response": ..} | {"feedback": ..}}` out of model text.
pub fn parse_decision(text: &str) -> Result<RawJoinOutput, JoinDecisionError> {
    let value = extract_json(text)
        .ok_or_else(|| JoinDecisionError::Malformed("no JSON object in reply".into()))?;
    let wire: WireDecision =
        serde_json::from_value(value).map_err(|e| JoinDecisionError::Malformed(e.to_string()))?;
    let action = match wire.action {
        WireAction::Final { response } => JoinAction::Final { response },
        WireAction::Replan { feedback } => JoinAction::Replan { feedback },
    };
    Ok(RawJoinOutput {
        reasoning: wire.thought,
        action,
    })
}

/// Asks an [`LlmClient`] for the decision.
pub struct LlmDecisionSource {
    llm: Arc<dyn LlmClient>,
}

impl LlmDecisionSource {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub fn messages(
        &self,
        request: &JoinRequest<'_>,
        previous_error: Option<&JoinDecisionError>,
    ) -> Vec<Message> {
        let first = request.first_round_index();
        let (earlier, current): (Vec<_>, Vec<_>) = request
            .context
            .iter()
            .partition(|e| first.is_some_and(|f| e.index < f));
        let render = |entries: Vec<&ContextEntry>| {
            entries
                .into_iter()
                .map(|e| e.observation())
                .collect::<Vec<_>>()
                .join("\n")
        };

        let mut user = format!("Request: {}", request.request);
        if !request.feedback_history.is_empty() {
            user.push_str("\n\nEarlier attempts:\n");
            for (n, feedback) in request.feedback_history.iter().enumerate() {
                user.push_str(&format!("{}. {}\n", n + 1, feedback));
            }
        }
        if !earlier.is_empty() {
            user.push_str("\nResults of earlier rounds:\n");
            user.push_str(&render(earlier));
            user.push('\n');
        }
        user.push_str(&format!("\nResults of round {}:\n", request.round));
        if current.is_empty() {
            user.push_str("(no actions ran)");
        } else {
            user.push_str(&render(current));
        }

        let mut messages = vec![Message::system(prompt::JOINER_SYSTEM), Message::user(user)];
        if let Some(error) = previous_error {
            messages.push(Message::user(
                prompt::FORMAT_REMINDER.replace("{error}", &error.to_string()),
            ));
        }
        messages
    }
}

#[async_trait]
impl DecisionSource for LlmDecisionSource {
    async fn decide(
        &self,
        request: &JoinRequest<'_>,
        previous_error: Option<&JoinDecisionError>,
    ) -> Result<RawJoinOutput, JoinDecisionError> {
        let messages = self.messages(request, previous_error);
        let response = self
            .llm
            .invoke(&messages)
            .await
            .map_err(|e| JoinDecisionError::Source(e.to_string()))?;
        parse_decision(&response.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;
    use crate::task::TaskOutcome;
    use serde_json::json;

    fn context() -> ExecutionContext {
        let mut ctx = ExecutionContext::new();
        ctx.record(ContextEntry {
            index: 1,
            round: 1,
            tool: "search".into(),
            arguments: json!({"query": "capital of France"}),
            outcome: TaskOutcome::Done(json!("Paris")),
        });
        ctx.record(ContextEntry {
            index: 3,
            round: 2,
            tool: "weather".into(),
            arguments: json!({"city": "Paris"}),
            outcome: TaskOutcome::Failed("tool failed: upstream timeout".into()),
        });
        ctx
    }

    fn request<'a>(ctx: &'a ExecutionContext, history: &'a [String]) -> JoinRequest<'a> {
        JoinRequest {
            request: "weather in the capital of France",
            context: ctx,
            round: 2,
            round_indices: vec![3, 4],
            feedback_history: history,
        }
    }

    #[test]
    fn parses_plain_and_fenced_replies() {
        let plain = parse_decision(r#"{"thought": "done", "action": {"response": "Paris"}}"#).unwrap();
        assert_eq!(plain.action, JoinAction::Final { response: "Paris".into() });
        let fenced = parse_decision(
            "Here you go:\n```json\n{\"reasoning\": \"missing\", \"action\": {\"feedback\": \"need weather\"}}\n```",
        )
        .unwrap();
        assert_eq!(fenced.reasoning, "missing");
        assert_eq!(fenced.action, JoinAction::Replan { feedback: "need weather".into() });
        assert!(matches!(
            parse_decision("Finish(Paris)"),
            Err(JoinDecisionError::Malformed(_))
        ));
        assert!(matches!(
            parse_decision(r#"{"action": {"response": "x"}}"#),
            Err(JoinDecisionError::Malformed(_))
        ));
    }

    /// **Scenario**: replan gets `next_index` one past the round's join, not the model's guess.
    #[tokio::test]
    async fn replan_carries_computed_next_index() {
        let ctx = context();
        let llm = MockLlm::with_reply(
            r#"{"thought": "weather failed", "action": {"feedback": "retry the weather lookup"}}"#,
        );
        let joiner = Joiner::new(Arc::new(LlmDecisionSource::new(Arc::new(llm))));
        let outcome = joiner.join(&request(&ctx, &[])).await.unwrap();
        assert_eq!(
            outcome.decision,
            JoinDecision::Replan {
                feedback: "retry the weather lookup".into(),
                next_index: 5
            }
        );
        assert_eq!(outcome.reasoning, "weather failed");
    }

    #[tokio::test]
    async fn malformed_decision_is_retried_once() {
        let ctx = context();
        let llm = Arc::new(
            MockLlm::new(["not json at all"])
                .then_reply(r#"{"thought": "ok", "action": {"response": "Paris, 18C"}}"#),
        );
        let joiner = Joiner::new(Arc::new(LlmDecisionSource::new(llm.clone())));
        let outcome = joiner.join(&request(&ctx, &[])).await.unwrap();
        assert_eq!(outcome.decision, JoinDecision::Final { text: "Paris, 18C".into() });
        assert_eq!(llm.calls(), 2);
        let retry = &llm.requests()[1];
        assert!(retry.last().unwrap().content().contains("could not be used"));
    }

    #[tokio::test]
    async fn repeated_malformed_decision_fails() {
        let ctx = context();
        let llm = Arc::new(MockLlm::with_reply(r#"{"thought": "", "action": {"response": "x"}}"#));
        let joiner = Joiner::new(Arc::new(LlmDecisionSource::new(llm.clone())));
        let err = joiner.join(&request(&ctx, &[])).await.unwrap_err();
        assert_eq!(err, JoinDecisionError::Malformed("reasoning is empty".into()));
        assert_eq!(llm.calls(), 2);
    }

    /// **Scenario**: failed results reach the joiner as their error text, split by round.
    #[test]
    fn prompt_contains_failures_and_history() {
        let ctx = context();
        let history = vec!["need the weather".to_string()];
        let source = LlmDecisionSource::new(Arc::new(MockLlm::with_reply("")));
        let messages = source.messages(&request(&ctx, &history), None);
        let user = messages[1].content();
        assert!(user.contains("1. need the weather"));
        assert!(user.contains("Results of earlier rounds:\n1. search("));
        assert!(user.contains("Results of round 2:\n3. weather(city=\"Paris\") -> error: tool failed: upstream timeout"));
    }

    #[test]
    fn next_index_without_context_starts_at_one() {
        let ctx = ExecutionContext::new();
        let req = JoinRequest {
            request: "x",
            context: &ctx,
            round: 1,
            round_indices: vec![],
            feedback_history: &[],
        };
        assert_eq!(req.next_index(), 1);
    }
}
