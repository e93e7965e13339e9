//! Append-only record of every resolved task, across all rounds of a thread.
//!
//! **Interaction**: Written by the [`Scheduler`](crate::scheduler::Scheduler) as tasks resolve;
//! read for reference substitution, by the [`Joiner`](crate::joiner::Joiner) and planner
//! prompts, and persisted inside a [`Session`](crate::session::Session).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::task::{render_value, TaskIndex, TaskOutcome};

/// One resolved task as observed by later rounds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub index: TaskIndex,
    /// Compiler round that produced the entry (1-based, counted per turn).
    pub round: u32,
    pub tool: String,
    /// Arguments after reference substitution, as sent to the tool.
    pub arguments: Value,
    pub outcome: TaskOutcome,
}

impl ContextEntry {
    /// `index. tool(args) -> result` line used in prompts.
    pub fn observation(&self) -> String {
        format!(
            "{}. {}({}) -> {}",
            self.index,
            self.tool,
            compact_args(&self.arguments),
            self.outcome.render()
        )
    }
}

fn compact_args(args: &Value) -> String {
    match args {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(", "),
        other => render_value(other),
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    entries: BTreeMap<TaskIndex, ContextEntry>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a resolved task. An index is written at most once; a second write is ignored
    /// and returns `false`.
    pub fn record(&mut self, entry: ContextEntry) -> bool {
        if self.entries.contains_key(&entry.index) {
            tracing::warn!(index = entry.index, "context entry already recorded; keeping first");
            return false;
        }
        self.entries.insert(entry.index, entry);
        true
    }

    pub fn contains(&self, index: TaskIndex) -> bool {
        self.entries.contains_key(&index)
    }

    pub fn get(&self, index: TaskIndex) -> Option<&ContextEntry> {
        self.entries.get(&index)
    }

    pub fn outcome(&self, index: TaskIndex) -> Option<TaskOutcome> {
        self.entries.get(&index).map(|e| e.outcome.clone())
    }

    /// Highest index recorded so far.
    pub fn max_index(&self) -> Option<TaskIndex> {
        self.entries.keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContextEntry> {
        self.entries.values()
    }

    /// Entries with index at or above `from`, in index order.
    pub fn since(&self, from: TaskIndex) -> impl Iterator<Item = &ContextEntry> {
        self.entries.range(from..).map(|(_, e)| e)
    }

    /// One observation line per entry at or above `from`.
    pub fn render_observations(&self, from: TaskIndex) -> String {
        self.since(from)
            .map(ContextEntry::observation)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Best-effort answer from what has run since `from`: the successful results in order.
    /// `None` when nothing succeeded.
    pub fn partial_answer(&self, from: TaskIndex) -> Option<String> {
        let parts: Vec<String> = self
            .since(from)
            .filter(|e| !e.outcome.is_failure())
            .map(|e| format!("{}: {}", e.tool, e.outcome.render()))
            .collect();
        (!parts.is_empty()).then(|| parts.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(index: TaskIndex, tool: &str, outcome: TaskOutcome) -> ContextEntry {
        ContextEntry {
            index,
            round: 1,
            tool: tool.into(),
            arguments: json!({"q": "x"}),
            outcome,
        }
    }

    #[test]
    fn record_is_write_once() {
        let mut ctx = ExecutionContext::new();
        assert!(ctx.record(entry(1, "search", TaskOutcome::Done(json!("a")))));
        assert!(!ctx.record(entry(1, "search", TaskOutcome::Done(json!("b")))));
        assert_eq!(ctx.outcome(1), Some(TaskOutcome::Done(json!("a"))));
    }

    #[test]
    fn max_index_tracks_highest_entry() {
        let mut ctx = ExecutionContext::new();
        assert_eq!(ctx.max_index(), None);
        ctx.record(entry(4, "a", TaskOutcome::Done(json!(1))));
        ctx.record(entry(2, "b", TaskOutcome::Done(json!(2))));
        assert_eq!(ctx.max_index(), Some(4));
    }

    #[test]
    fn observations_render_failures_as_error_text() {
        let mut ctx = ExecutionContext::new();
        ctx.record(entry(1, "search", TaskOutcome::Done(json!("paris"))));
        ctx.record(entry(2, "fetch", TaskOutcome::Failed("timeout".into())));
        assert_eq!(
            ctx.render_observations(1),
            "1. search(q=\"x\") -> paris\n2. fetch(q=\"x\") -> error: timeout"
        );
        assert_eq!(ctx.render_observations(2), "2. fetch(q=\"x\") -> error: timeout");
    }

    #[test]
    fn partial_answer_skips_failures() {
        let mut ctx = ExecutionContext::new();
        ctx.record(entry(1, "fetch", TaskOutcome::Failed("timeout".into())));
        assert_eq!(ctx.partial_answer(1), None);
        ctx.record(entry(2, "search", TaskOutcome::Done(json!("paris"))));
        assert_eq!(ctx.partial_answer(1).as_deref(), Some("search: paris"));
    }

    #[test]
    fn serde_roundtrip_preserves_entries() {
        let mut ctx = ExecutionContext::new();
        ctx.record(entry(3, "fetch", TaskOutcome::Failed("404".into())));
        let text = serde_json::to_string(&ctx).unwrap();
        let back: ExecutionContext = serde_json::from_str(&text).unwrap();
        assert_eq!(back, ctx);
    }
}
