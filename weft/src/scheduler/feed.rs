//! Streaming task admission: parser output passed through the round's [`GraphBuilder`].

use crate::context::ExecutionContext;
use crate::graph::{BuildError, GraphBuilder};
use crate::parser::{ParsedTask, PlanParseError, PlanParser};
use crate::task::{Task, TaskIndex};

/// Tasks of one round as they arrive from the plan stream.
///
/// **Interaction**: Created by the [`Compiler`](crate::compiler::Compiler) for each round and
/// drained by [`Scheduler::execute`](crate::scheduler::Scheduler::execute), which interleaves
/// admission with tool completions.
pub struct PlanFeed {
    parser: PlanParser,
    builder: GraphBuilder,
}

impl PlanFeed {
    pub fn new(parser: PlanParser, builder: GraphBuilder) -> Self {
        Self { parser, builder }
    }

    pub fn builder(&self) -> &GraphBuilder {
        &self.builder
    }

    /// First index of the round.
    pub fn first_index(&self) -> TaskIndex {
        self.builder.first_index()
    }

    /// Lines the parser skipped so far.
    pub fn diagnostics(&self) -> &[PlanParseError] {
        self.parser.diagnostics()
    }

    /// Cancel-safe; see [`PlanParser::next_task`].
    pub(crate) async fn next_parsed(&mut self) -> Option<ParsedTask> {
        self.parser.next_task().await
    }

    pub(crate) fn admit(
        &mut self,
        parsed: ParsedTask,
        context: &ExecutionContext,
    ) -> Result<Option<Task>, BuildError> {
        self.builder.admit(parsed, context)
    }

    /// Called once the parser is exhausted.
    pub(crate) fn finish(&mut self) -> Result<Option<Task>, BuildError> {
        self.builder.close()
    }
}
