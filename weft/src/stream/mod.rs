//! Streaming types: plan text chunks and compiler progress events.
//!
//! **Interaction**: [`MessageChunk`] flows from a [`PlanSource`](crate::planner::PlanSource)
//! (or [`LlmClient::invoke_stream`](crate::llm::LlmClient::invoke_stream)) to the
//! [`PlanParser`](crate::parser::PlanParser). [`CompileEvent`]s are emitted through an
//! [`EventSink`] given to [`Compiler::with_events`](crate::compiler::Compiler::with_events).

use serde::Serialize;
use tokio::sync::mpsc;

use crate::task::TaskIndex;

/// A piece of model output. Boundaries are arbitrary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageChunk {
    pub content: String,
}

impl MessageChunk {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

/// Progress of a compile turn, for UIs and logs.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompileEvent {
    RoundStarted {
        round: u32,
        next_index: TaskIndex,
    },
    TaskAdmitted {
        index: TaskIndex,
        tool: Option<String>,
        dependencies: Vec<TaskIndex>,
    },
    TaskDispatched {
        index: TaskIndex,
        tool: String,
    },
    TaskResolved {
        index: TaskIndex,
        failed: bool,
    },
    PlanLineSkipped {
        line: usize,
        reason: String,
    },
    RoundAbandoned {
        round: u32,
        reason: String,
    },
    Joined {
        round: u32,
        reasoning: String,
        replan: bool,
    },
    Finished {
        rounds: u32,
        failed: bool,
    },
}

/// Non-blocking event sender. A full or closed channel drops the event.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: mpsc::Sender<CompileEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<CompileEvent>) -> Self {
        Self { tx }
    }

    /// Creates a sink and its receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<CompileEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Returns `true` if the event was queued.
    pub fn emit(&self, event: CompileEvent) -> bool {
        self.tx.try_send(event).is_ok()
    }
}

/// Emits through an optional sink.
pub(crate) fn emit(sink: &Option<EventSink>, event: CompileEvent) {
    if let Some(sink) = sink {
        if !sink.emit(event) {
            tracing::trace!("compile event dropped");
        }
    }
}
