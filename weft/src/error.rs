//! Turn-fatal errors of [`Compiler::compile`](crate::compiler::Compiler::compile).
//!
//! Everything the loop can recover from (bad plans, tool failures, joiner trouble) ends in a
//! [`CompileOutcome`](crate::compiler::CompileOutcome) instead.

use crate::session::SessionError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("loading session failed: {0}")]
    SessionLoad(SessionError),
    #[error("saving session failed: {0}")]
    SessionSave(SessionError),
    #[error("turn cancelled")]
    Cancelled,
}
