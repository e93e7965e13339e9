//! Task model shared by the parser, graph builder, scheduler and joiner.
//!
//! A [`Task`] is one planned unit of work: a tool call whose arguments may refer to the
//! results of earlier tasks (`$N` / `${N}`), or the terminal `join` marker of a round.
//!
//! **Interaction**: Produced by [`GraphBuilder`](crate::graph::GraphBuilder) from
//! [`ParsedTask`](crate::parser::ParsedTask); driven through [`TaskStatus`] by the
//! [`Scheduler`](crate::scheduler::Scheduler).

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Index of a task. Increases monotonically across every round of a request and never repeats.
pub type TaskIndex = u32;

/// What a task does when it runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskKind {
    /// Invoke the named tool.
    Tool { name: String },
    /// Terminal marker of a round; depends on every tool task of that round.
    Join,
}

impl TaskKind {
    pub fn tool(name: impl Into<String>) -> Self {
        Self::Tool { name: name.into() }
    }

    pub fn is_join(&self) -> bool {
        matches!(self, Self::Join)
    }

    pub fn tool_name(&self) -> Option<&str> {
        match self {
            Self::Tool { name } => Some(name),
            Self::Join => None,
        }
    }
}

/// Lifecycle of a task: `Pending -> Ready -> Running -> Done | Failed`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Ready,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    /// Done and Failed are both terminal; dependents may proceed either way.
    pub fn is_resolved(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Result of a resolved task. A failure still resolves: dependents receive its error text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum TaskOutcome {
    Done(Value),
    Failed(String),
}

impl TaskOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn status(&self) -> TaskStatus {
        match self {
            Self::Done(_) => TaskStatus::Done,
            Self::Failed(_) => TaskStatus::Failed,
        }
    }

    /// Value substituted for a `$N` reference to this task.
    pub fn as_value(&self) -> Value {
        match self {
            Self::Done(v) => v.clone(),
            Self::Failed(e) => Value::String(format!("error: {}", e)),
        }
    }

    /// Text form used in templates and prompts: strings unquoted, everything else as JSON.
    pub fn render(&self) -> String {
        render_value(&self.as_value())
    }
}

pub(crate) fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One argument value as written in the plan.
#[derive(Clone, Debug, PartialEq)]
pub enum ArgValue {
    /// Plain JSON literal with no references inside.
    Literal(Value),
    /// `$N` / `${N}` standing alone: replaced by the referenced result value.
    Reference(TaskIndex),
    /// String literal embedding `${N}` markers: replaced textually.
    Template(String),
    List(Vec<ArgValue>),
    Map(Vec<(String, ArgValue)>),
}

/// A `${N}` occurrence inside a template string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Marker {
    start: usize,
    end: usize,
    index: TaskIndex,
}

/// Scans `text` for `${N}` markers. A bare `$N` inside text stays literal (prices, shell vars).
fn markers(text: &str) -> Vec<Marker> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' || bytes.get(i + 1) != Some(&b'{') {
            i += 1;
            continue;
        }
        let digits_start = i + 2;
        let mut j = digits_start;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }
        if j > digits_start && bytes.get(j) == Some(&b'}') {
            if let Ok(index) = text[digits_start..j].parse::<TaskIndex>() {
                out.push(Marker {
                    start: i,
                    end: j + 1,
                    index,
                });
                i = j + 1;
                continue;
            }
        }
        i += 1;
    }
    out
}

/// True when `text` contains at least one `${N}` marker.
pub fn has_reference(text: &str) -> bool {
    !markers(text).is_empty()
}

/// Rewrites every marker in `text` through `f`, keeping the surrounding text.
fn rewrite_markers<E>(
    text: &str,
    mut f: impl FnMut(TaskIndex) -> Result<String, E>,
) -> Result<String, E> {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for m in markers(text) {
        out.push_str(&text[last..m.start]);
        out.push_str(&f(m.index)?);
        last = m.end;
    }
    out.push_str(&text[last..]);
    Ok(out)
}

impl ArgValue {
    /// Builds a string argument: a [`ArgValue::Template`] when it carries markers, else a literal.
    pub fn string(text: impl Into<String>) -> Self {
        let text = text.into();
        if has_reference(&text) {
            Self::Template(text)
        } else {
            Self::Literal(Value::String(text))
        }
    }

    /// Collects every task index this value refers to.
    pub fn collect_references(&self, out: &mut BTreeSet<TaskIndex>) {
        match self {
            Self::Literal(_) => {}
            Self::Reference(i) => {
                out.insert(*i);
            }
            Self::Template(t) => out.extend(markers(t).into_iter().map(|m| m.index)),
            Self::List(items) => items.iter().for_each(|v| v.collect_references(out)),
            Self::Map(entries) => entries.iter().for_each(|(_, v)| v.collect_references(out)),
        }
    }

    /// Returns a copy with every reference passed through `f` (used for renumbering).
    pub fn remap<E>(
        &self,
        f: &mut impl FnMut(TaskIndex) -> Result<TaskIndex, E>,
    ) -> Result<Self, E> {
        Ok(match self {
            Self::Literal(v) => Self::Literal(v.clone()),
            Self::Reference(i) => Self::Reference(f(*i)?),
            Self::Template(t) => {
                Self::Template(rewrite_markers(t, |i| f(i).map(|n| format!("${{{}}}", n)))?)
            }
            Self::List(items) => Self::List(
                items
                    .iter()
                    .map(|v| v.remap(f))
                    .collect::<Result<_, _>>()?,
            ),
            Self::Map(entries) => Self::Map(
                entries
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), v.remap(f)?)))
                    .collect::<Result<_, E>>()?,
            ),
        })
    }

    /// Substitutes references with results from `lookup`. Fails with the first missing index.
    pub fn resolve(
        &self,
        lookup: &impl Fn(TaskIndex) -> Option<TaskOutcome>,
    ) -> Result<Value, TaskIndex> {
        Ok(match self {
            Self::Literal(v) => v.clone(),
            Self::Reference(i) => lookup(*i).ok_or(*i)?.as_value(),
            Self::Template(t) => {
                Value::String(rewrite_markers(t, |i| lookup(i).map(|o| o.render()).ok_or(i))?)
            }
            Self::List(items) => Value::Array(
                items
                    .iter()
                    .map(|v| v.resolve(lookup))
                    .collect::<Result<_, _>>()?,
            ),
            Self::Map(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), v.resolve(lookup)?)))
                    .collect::<Result<_, TaskIndex>>()?,
            ),
        })
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(v) => write!(f, "{}", v),
            Self::Reference(i) => write!(f, "${}", i),
            Self::Template(t) => write!(f, "{:?}", t),
            Self::List(items) => {
                f.write_str("[")?;
                for (n, v) in items.iter().enumerate() {
                    if n > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                f.write_str("]")
            }
            Self::Map(entries) => {
                f.write_str("{")?;
                for (n, (k, v)) in entries.iter().enumerate() {
                    if n > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{:?}: {}", k, v)?;
                }
                f.write_str("}")
            }
        }
    }
}

/// Ordered `name=value` arguments of a task call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Arguments(Vec<(String, ArgValue)>);

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: ArgValue) -> Self {
        self.0.push((name.into(), value));
        self
    }

    pub fn push(&mut self, name: impl Into<String>, value: ArgValue) {
        self.0.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.0.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArgValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn references(&self) -> BTreeSet<TaskIndex> {
        let mut out = BTreeSet::new();
        for (_, v) in &self.0 {
            v.collect_references(&mut out);
        }
        out
    }

    pub fn remap<E>(
        &self,
        mut f: impl FnMut(TaskIndex) -> Result<TaskIndex, E>,
    ) -> Result<Self, E> {
        self.0
            .iter()
            .map(|(k, v)| Ok((k.clone(), v.remap(&mut f)?)))
            .collect::<Result<Vec<_>, E>>()
            .map(Self)
    }

    /// Resolves into the JSON object passed to the tool.
    pub fn resolve(
        &self,
        lookup: impl Fn(TaskIndex) -> Option<TaskOutcome>,
    ) -> Result<Value, TaskIndex> {
        let mut map = serde_json::Map::with_capacity(self.0.len());
        for (k, v) in &self.0 {
            map.insert(k.clone(), v.resolve(&lookup)?);
        }
        Ok(Value::Object(map))
    }
}

impl fmt::Display for Arguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (n, (k, v)) in self.0.iter().enumerate() {
            if n > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", k, v)?;
        }
        Ok(())
    }
}

/// A planned unit of work, admitted into a round's graph.
#[derive(Clone, Debug, PartialEq)]
pub struct Task {
    pub index: TaskIndex,
    pub kind: TaskKind,
    pub arguments: Arguments,
    /// Derived from `arguments` for tool tasks; every tool task of the round for `Join`.
    pub dependencies: BTreeSet<TaskIndex>,
    pub status: TaskStatus,
    pub result: Option<TaskOutcome>,
    /// `Thought:` line that preceded this task in the plan text.
    pub thought: Option<String>,
}

impl Task {
    pub fn tool(index: TaskIndex, name: impl Into<String>, arguments: Arguments) -> Self {
        let dependencies = arguments.references();
        Self {
            index,
            kind: TaskKind::tool(name),
            arguments,
            dependencies,
            status: TaskStatus::Pending,
            result: None,
            thought: None,
        }
    }

    pub fn join(index: TaskIndex, dependencies: BTreeSet<TaskIndex>) -> Self {
        Self {
            index,
            kind: TaskKind::Join,
            arguments: Arguments::new(),
            dependencies,
            status: TaskStatus::Pending,
            result: None,
            thought: None,
        }
    }

    pub fn tool_name(&self) -> Option<&str> {
        self.kind.tool_name()
    }

    pub fn is_join(&self) -> bool {
        self.kind.is_join()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            TaskKind::Tool { name } => write!(f, "{}. {}({})", self.index, name, self.arguments),
            TaskKind::Join => write!(f, "{}. join()", self.index),
        }
    }
}
