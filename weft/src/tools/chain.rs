//! Nested tool-call trees: run a fixed set of calls without going through planning.
//!
//! JSON shape (a bare list at the root runs its items in order):
//!
//! ```json
//! {
//!   "tool_chain": "sequential",
//!   "tools": [
//!     {"tool": "read_email", "arguments": {"id": "42"}},
//!     {"tool_chain": "parallel", "tools": [{"tool": "search", "arguments": {"query": "x"}}]}
//!   ]
//! }
//! ```

use std::fmt;

use futures::future::{join_all, BoxFuture};
use serde_json::Value;
use thiserror::Error;

use crate::task::render_value;
use crate::tools::{ToolError, ToolResolver};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("tool chain nests deeper than {limit} levels")]
    TooDeep { limit: usize },
    #[error("invalid tool chain: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum ToolChain {
    Call { tool: String, arguments: Value },
    Sequential(Vec<ToolChain>),
    Parallel(Vec<ToolChain>),
}

/// Result of one leaf call.
#[derive(Clone, Debug, PartialEq)]
pub struct ChainResult {
    pub tool: String,
    pub outcome: Result<Value, ToolError>,
}

impl fmt::Display for ChainResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            Ok(v) => write!(f, "{} → {}", self.tool, render_value(v)),
            Err(ToolError::NotFound(_)) => write!(f, "{} → Tool not found", self.tool),
            Err(e) => write!(f, "{} → Error: {}", self.tool, e),
        }
    }
}

/// True when `value` looks like a call or chain (or a list holding one).
pub(crate) fn is_instruction(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.contains_key("tool") || map.contains_key("tool_chain"),
        Value::Array(items) => items.iter().any(is_instruction),
        _ => false,
    }
}

impl ToolChain {
    /// Parses a chain, rejecting trees nested deeper than `max_depth` groups.
    pub fn from_value(value: &Value, max_depth: usize) -> Result<Self, ChainError> {
        Self::parse(value, 0, max_depth)
    }

    fn parse(value: &Value, depth: usize, max_depth: usize) -> Result<Self, ChainError> {
        let group = |items: &[Value]| -> Result<Vec<ToolChain>, ChainError> {
            if depth >= max_depth {
                return Err(ChainError::TooDeep { limit: max_depth });
            }
            items
                .iter()
                .map(|v| Self::parse(v, depth + 1, max_depth))
                .collect()
        };
        match value {
            Value::Array(items) => Ok(Self::Sequential(group(items)?)),
            Value::Object(map) => {
                if let Some(tool) = map.get("tool") {
                    let tool = tool
                        .as_str()
                        .ok_or_else(|| ChainError::Invalid("`tool` must be a string".into()))?;
                    let arguments = map
                        .get("arguments")
                        .cloned()
                        .unwrap_or_else(|| Value::Object(Default::default()));
                    return Ok(Self::Call {
                        tool: tool.to_string(),
                        arguments,
                    });
                }
                let items = map
                    .get("tools")
                    .and_then(Value::as_array)
                    .ok_or_else(|| ChainError::Invalid("group needs a `tools` list".into()))?;
                match map.get("tool_chain").and_then(Value::as_str) {
                    Some("parallel") => Ok(Self::Parallel(group(items)?)),
                    Some("sequential") | None => Ok(Self::Sequential(group(items)?)),
                    Some(other) => Err(ChainError::Invalid(format!(
                        "unknown tool_chain mode `{}`",
                        other
                    ))),
                }
            }
            other => Err(ChainError::Invalid(format!("unexpected node {}", other))),
        }
    }

    /// Nesting depth; a single call is 0.
    pub fn depth(&self) -> usize {
        match self {
            Self::Call { .. } => 0,
            Self::Sequential(items) | Self::Parallel(items) => {
                1 + items.iter().map(Self::depth).max().unwrap_or(0)
            }
        }
    }

    /// Runs the tree; results come back flattened in tree order.
    pub fn execute<'a>(&'a self, resolver: &'a dyn ToolResolver) -> BoxFuture<'a, Vec<ChainResult>> {
        Box::pin(async move {
            match self {
                Self::Call { tool, arguments } => {
                    let outcome = resolver.invoke(tool, arguments.clone()).await;
                    if let Err(e) = &outcome {
                        tracing::warn!(tool = %tool, error = %e, "chained tool call failed");
                    }
                    vec![ChainResult {
                        tool: tool.clone(),
                        outcome,
                    }]
                }
                Self::Sequential(items) => {
                    let mut out = Vec::new();
                    for item in items {
                        out.extend(item.execute(resolver).await);
                    }
                    out
                }
                Self::Parallel(items) => join_all(items.iter().map(|i| i.execute(resolver)))
                    .await
                    .into_iter()
                    .flatten()
                    .collect(),
            }
        })
    }

    /// Runs the tool instructions embedded in model output, if there are any.
    ///
    /// Returns `Ok(None)` when `text` holds no instruction, otherwise one line per call.
    pub async fn run_embedded(
        text: &str,
        resolver: &dyn ToolResolver,
        max_depth: usize,
    ) -> Result<Option<String>, ChainError> {
        let Some(value) = crate::tools::extract_json(text).filter(is_instruction) else {
            return Ok(None);
        };
        let chain = Self::from_value(&value, max_depth)?;
        let lines: Vec<String> = chain
            .execute(resolver)
            .await
            .iter()
            .map(ToString::to_string)
            .collect();
        Ok(Some(lines.join("\n")))
    }
}
