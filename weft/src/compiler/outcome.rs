//! Terminal results of a compile turn.

use thiserror::Error;

/// Why a turn ended in [`CompileOutcome::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("no final answer after {max_rounds} rounds")]
    ReplanLoopExceeded { max_rounds: u32 },
    #[error("plan exceeded {limit} tasks in one round")]
    IterationBudgetExceeded { limit: usize },
    #[error("join decision failed: {0}")]
    JoinDecision(String),
    #[error("plan generation failed: {0}")]
    PlanSource(String),
}

/// Result of [`Compiler::compile`](crate::compiler::Compiler::compile).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    Done {
        answer: String,
        rounds: u32,
    },
    /// `partial_answer` holds whatever the turn's successful tasks produced, if anything.
    Failed {
        reason: FailureReason,
        partial_answer: Option<String>,
        rounds: u32,
    },
}

impl CompileOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }

    /// The final answer; `None` for failures.
    pub fn answer(&self) -> Option<&str> {
        match self {
            Self::Done { answer, .. } => Some(answer),
            Self::Failed { .. } => None,
        }
    }

    pub fn rounds(&self) -> u32 {
        match self {
            Self::Done { rounds, .. } | Self::Failed { rounds, .. } => *rounds,
        }
    }

    /// Text to show the user. Failures are labelled so they never read as a final answer.
    pub fn to_text(&self) -> String {
        match self {
            Self::Done { answer, .. } => answer.clone(),
            Self::Failed {
                reason,
                partial_answer: Some(partial),
                ..
            } => format!("Incomplete answer ({}):\n{}", reason, partial),
            Self::Failed { reason, .. } => format!("No answer: {}", reason),
        }
    }
}
