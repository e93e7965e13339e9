//! Incremental plan parser.
//!
//! Reads model output chunk by chunk and emits each task as soon as its line is complete,
//! so execution can start while the plan is still being written. Chunk boundaries carry no
//! meaning; a line may be split across any number of chunks.
//!
//! Line grammar:
//!
//! ```text
//! Thought: <free text>            attaches to the next task
//! <N>. <tool>(<arg>=<value>, ...) [# comment]
//! <N>. join()                     terminal task of the round (bare `join()` also accepted)
//! <END_OF_PLAN>                   ends the plan
//! ```
//!
//! Anything else is skipped and recorded as a [`PlanParseError`]. Lines after the join are
//! ignored.
//!
//! **Interaction**: [`PlanParser`] consumes the receiver side of the channel a
//! [`PlanSource`](crate::planner::PlanSource) writes to; its output feeds
//! [`GraphBuilder::admit`](crate::graph::GraphBuilder::admit).

mod args;

use std::collections::VecDeque;

use futures::Stream;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::stream::MessageChunk;
use crate::task::{Arguments, TaskIndex, TaskKind};

pub const END_OF_PLAN: &str = "<END_OF_PLAN>";
pub const JOIN_TOOL: &str = "join";

/// A line that could not be read as part of the plan. Parsing continues after it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("plan line {line}: {reason}: `{text}`")]
pub struct PlanParseError {
    pub line: usize,
    pub text: String,
    pub reason: String,
}

/// A task as written in the plan, before numbering and dependency checks.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedTask {
    /// Declared index; `None` only for a bare `join()`.
    pub index: Option<TaskIndex>,
    pub kind: TaskKind,
    pub arguments: Arguments,
    pub thought: Option<String>,
    /// 1-based line number in the plan text.
    pub line: usize,
}

impl ParsedTask {
    pub fn is_join(&self) -> bool {
        self.kind.is_join()
    }
}

static TASK_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+)\s*[.)]\s*([A-Za-z_][A-Za-z0-9_]*)\s*\(").expect("task header regex")
});
static NUMBERED: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+\s*[.)]").expect("numbered regex"));

enum Line {
    Blank,
    Thought(String),
    Task(ParsedTask),
    Malformed(String),
    Prose,
}

fn classify(text: &str, line: usize) -> Line {
    let text = text.trim();
    if text.is_empty() {
        return Line::Blank;
    }
    if let Some(thought) = text.strip_prefix("Thought:") {
        return Line::Thought(thought.trim().to_string());
    }
    let (index, name, after_paren) = if let Some(caps) = TASK_HEADER.captures(text) {
        let (Some(num), Some(name), Some(whole)) = (caps.get(1), caps.get(2), caps.get(0)) else {
            return Line::Malformed("unreadable task header".to_string());
        };
        let Ok(index) = num.as_str().parse::<TaskIndex>() else {
            return Line::Malformed(format!("task index `{}` out of range", num.as_str()));
        };
        (Some(index), name.as_str(), &text[whole.end()..])
    } else if let Some(rest) = text.strip_prefix(JOIN_TOOL).map(str::trim_start) {
        match rest.strip_prefix('(') {
            Some(after) => (None, JOIN_TOOL, after),
            None => return Line::Prose,
        }
    } else if NUMBERED.is_match(text) {
        return Line::Malformed("expected `N. tool(arg=value, ...)`".to_string());
    } else {
        return Line::Prose;
    };

    let (arguments, rest) = match args::parse_call_arguments(after_paren) {
        Ok(parsed) => parsed,
        Err(reason) => return Line::Malformed(reason),
    };
    let rest = rest.trim();
    if !(rest.is_empty() || rest.starts_with('#')) {
        return Line::Malformed(format!("trailing text after call: `{}`", rest));
    }
    let kind = if name == JOIN_TOOL {
        TaskKind::Join
    } else {
        TaskKind::tool(name)
    };
    Line::Task(ParsedTask {
        index,
        kind,
        arguments,
        thought: None,
        line,
    })
}

/// Line assembly and classification, independent of where the text comes from.
#[derive(Debug, Default)]
struct LineReader {
    buffer: String,
    line_no: usize,
    pending_thought: Option<String>,
    ready: VecDeque<ParsedTask>,
    finished: bool,
    diagnostics: Vec<PlanParseError>,
}

impl LineReader {
    fn push_text(&mut self, text: &str) {
        if self.finished {
            return;
        }
        self.buffer.push_str(text);
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            self.handle_line(line.trim_end_matches(['\n', '\r']), false);
            if self.finished {
                self.buffer.clear();
                break;
            }
        }
    }

    /// End of input. A trailing line without newline is kept only if it is a complete task.
    fn finish(&mut self) {
        if !self.finished && !self.buffer.trim().is_empty() {
            let tail = std::mem::take(&mut self.buffer);
            self.handle_line(&tail, true);
        }
        self.buffer.clear();
        self.finished = true;
    }

    fn handle_line(&mut self, raw: &str, trailing: bool) {
        self.line_no += 1;
        let (text, ends_plan) = match raw.find(END_OF_PLAN) {
            Some(pos) => (&raw[..pos], true),
            None => (raw, false),
        };
        match classify(text, self.line_no) {
            Line::Blank => {}
            Line::Thought(t) if !trailing => self.pending_thought = Some(t),
            Line::Task(mut task) => {
                task.thought = self.pending_thought.take();
                let is_join = task.is_join();
                tracing::debug!(line = self.line_no, index = ?task.index, "plan task parsed");
                self.ready.push_back(task);
                if is_join {
                    self.finished = true;
                }
            }
            // An incomplete trailing fragment is dropped without a diagnostic.
            _ if trailing => {}
            Line::Malformed(reason) => {
                tracing::warn!(line = self.line_no, %reason, text, "skipping malformed plan line");
                self.record(text, reason);
            }
            Line::Prose => {
                tracing::debug!(line = self.line_no, text, "skipping non-task plan line");
                self.record(text, "not a task line".to_string());
            }
            Line::Thought(_) => {}
        }
        if ends_plan {
            self.finished = true;
        }
    }

    fn record(&mut self, text: &str, reason: String) {
        self.diagnostics.push(PlanParseError {
            line: self.line_no,
            text: text.trim().to_string(),
            reason,
        });
    }
}

/// Parses a complete plan text in one go. Returns the tasks and the skipped-line diagnostics.
pub fn parse_plan(text: &str) -> (Vec<ParsedTask>, Vec<PlanParseError>) {
    let mut reader = LineReader::default();
    reader.push_text(text);
    reader.finish();
    (reader.ready.into_iter().collect(), reader.diagnostics)
}

/// Pull-based parser over a chunk channel.
///
/// The channel closing is the end-of-stream signal. After the join (or `<END_OF_PLAN>`) the
/// receiver is closed so the producer stops writing.
pub struct PlanParser {
    rx: mpsc::Receiver<MessageChunk>,
    reader: LineReader,
    emitted: usize,
}

impl PlanParser {
    pub fn new(rx: mpsc::Receiver<MessageChunk>) -> Self {
        Self {
            rx,
            reader: LineReader::default(),
            emitted: 0,
        }
    }

    /// Next complete task, or `None` once the plan has ended.
    ///
    /// Cancel-safe: parser state only changes after a chunk has been received, so dropping
    /// the future (e.g. in `tokio::select!`) loses nothing.
    pub async fn next_task(&mut self) -> Option<ParsedTask> {
        loop {
            if let Some(task) = self.reader.ready.pop_front() {
                self.emitted += 1;
                return Some(task);
            }
            if self.reader.finished {
                self.rx.close();
                return None;
            }
            match self.rx.recv().await {
                Some(chunk) => self.reader.push_text(&chunk.content),
                None => self.reader.finish(),
            }
        }
    }

    /// Number of tasks handed out so far.
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    pub fn diagnostics(&self) -> &[PlanParseError] {
        &self.reader.diagnostics
    }

    /// Whether the plan has ended and every parsed task has been handed out.
    pub fn is_exhausted(&self) -> bool {
        self.reader.finished && self.reader.ready.is_empty()
    }

    /// Adapts the parser into a [`Stream`] of tasks.
    pub fn into_stream(self) -> impl Stream<Item = ParsedTask> {
        futures::stream::unfold(self, |mut parser| async move {
            parser.next_task().await.map(|task| (task, parser))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ArgValue;
    use futures::StreamExt;
    use serde_json::json;

    fn chunks(parts: &[&str]) -> mpsc::Receiver<MessageChunk> {
        let (tx, rx) = mpsc::channel(parts.len().max(1));
        for p in parts {
            tx.try_send(MessageChunk {
                content: p.to_string(),
            })
            .unwrap();
        }
        rx
    }

    #[test]
    fn whole_plan_with_thoughts_and_join() {
        let text = "Thought: find the capital first\n\
                    1. search(query=\"capital of France\")\n\
                    2. weather(city=$1)\n\
                    Thought: done\n\
                    3. join()\n\
                    <END_OF_PLAN>\n";
        let (tasks, diags) = parse_plan(text);
        assert!(diags.is_empty(), "{:?}", diags);
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].thought.as_deref(), Some("find the capital first"));
        assert_eq!(tasks[1].arguments.get("city"), Some(&ArgValue::Reference(1)));
        assert!(tasks[1].thought.is_none());
        assert!(tasks[2].is_join());
        assert_eq!(tasks[2].thought.as_deref(), Some("done"));
    }

    /// **Scenario**: a malformed line is skipped with a diagnostic; later lines still parse.
    #[test]
    fn malformed_line_is_skipped() {
        let text = "1. search(query=\"a\")\n2. broken(query=\n3. search(query=\"b\")\n";
        let (tasks, diags) = parse_plan(text);
        assert_eq!(tasks.iter().map(|t| t.index).collect::<Vec<_>>(), vec![Some(1), Some(3)]);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].line, 2);
    }

    #[test]
    fn deeply_nested_line_becomes_diagnostic() {
        let text = format!(
            "1. a(x={}{})\n2. b(y=1)\n",
            "[".repeat(20_000),
            "]".repeat(20_000)
        );
        let (tasks, diags) = parse_plan(&text);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].kind, TaskKind::tool("b"));
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].line, 1);
        assert_eq!(diags[0].reason, "value nested too deeply");
    }

    #[test]
    fn prose_lines_are_recorded_but_ignored() {
        let (tasks, diags) = parse_plan("Here is the plan:\n1. search(query=\"a\")\n");
        assert_eq!(tasks.len(), 1);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].reason, "not a task line");
    }

    #[test]
    fn lines_after_join_are_ignored() {
        let (tasks, diags) = parse_plan("1. a()\n2. join()\n3. b()\nnoise\n");
        assert_eq!(tasks.len(), 2);
        assert!(diags.is_empty());
    }

    #[test]
    fn end_of_plan_on_same_line_as_join() {
        let (tasks, _) = parse_plan("1. a(x=1)\n2. join()<END_OF_PLAN>\n3. b()\n");
        assert_eq!(tasks.len(), 2);
        assert!(tasks[1].is_join());
    }

    #[test]
    fn trailing_comment_and_bare_join() {
        let (tasks, diags) = parse_plan("1. fetch(url=\"http://x/#a\") # grab page\njoin()\n");
        assert!(diags.is_empty());
        assert_eq!(tasks[0].arguments.get("url"), Some(&ArgValue::Literal(json!("http://x/#a"))));
        assert_eq!(tasks[1].index, None);
        assert!(tasks[1].is_join());
    }

    /// **Scenario**: a complete trailing line without newline is kept; a partial one is dropped.
    #[test]
    fn trailing_line_without_newline() {
        let (tasks, diags) = parse_plan("1. a(x=1)\n2. b(y=2)");
        assert_eq!(tasks.len(), 2);
        assert!(diags.is_empty());

        let (tasks, diags) = parse_plan("1. a(x=1)\n2. b(y=\"unfinis");
        assert_eq!(tasks.len(), 1);
        assert!(diags.is_empty());
    }

    #[tokio::test]
    async fn chunks_split_inside_tokens() {
        let mut parser = PlanParser::new(chunks(&[
            "1. sea",
            "rch(query=\"rust",
            " async\")\n2. summarize(text=$",
            "1)\n",
            "3. join",
            "()\n",
        ]));
        let first = parser.next_task().await.unwrap();
        assert_eq!(first.kind, TaskKind::tool("search"));
        assert_eq!(first.arguments.get("query"), Some(&ArgValue::Literal(json!("rust async"))));
        let second = parser.next_task().await.unwrap();
        assert_eq!(second.arguments.get("text"), Some(&ArgValue::Reference(1)));
        assert!(parser.next_task().await.unwrap().is_join());
        assert!(parser.next_task().await.is_none());
        assert_eq!(parser.emitted(), 3);
        assert!(parser.is_exhausted());
    }

    #[tokio::test]
    async fn closed_channel_ends_plan() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(MessageChunk {
            content: "1. a(x=1)\n".into(),
        })
        .await
        .unwrap();
        drop(tx);
        let tasks: Vec<_> = PlanParser::new(rx).into_stream().collect().await;
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn empty_stream_yields_nothing() {
        let mut parser = PlanParser::new(chunks(&["\n", "  \n"]));
        assert!(parser.next_task().await.is_none());
        assert_eq!(parser.emitted(), 0);
    }

    /// **Scenario**: dropping `next_task` mid-wait (as `select!` does) loses no text.
    #[tokio::test]
    async fn next_task_is_cancel_safe() {
        let (tx, rx) = mpsc::channel(4);
        let mut parser = PlanParser::new(rx);
        tx.send(MessageChunk {
            content: "1. a(x=".into(),
        })
        .await
        .unwrap();
        let timed_out =
            tokio::time::timeout(std::time::Duration::from_millis(20), parser.next_task()).await;
        assert!(timed_out.is_err());
        tx.send(MessageChunk {
            content: "1)\n".into(),
        })
        .await
        .unwrap();
        let task = parser.next_task().await.unwrap();
        assert_eq!(task.arguments.get("x"), Some(&ArgValue::Literal(json!(1))));
    }

    #[tokio::test]
    async fn producer_is_stopped_after_join() {
        let (tx, rx) = mpsc::channel(4);
        let mut parser = PlanParser::new(rx);
        tx.send(MessageChunk {
            content: "1. join()\n".into(),
        })
        .await
        .unwrap();
        assert!(parser.next_task().await.unwrap().is_join());
        assert!(parser.next_task().await.is_none());
        assert!(tx
            .send(MessageChunk {
                content: "2. late()\n".into()
            })
            .await
            .is_err());
    }
}
