//! Tool capability layer: what the scheduler dispatches tasks to.
//!
//! - [`Tool`]: one named capability with a [`ToolSpec`] (description + JSON schema).
//! - [`ToolResolver`]: name-based dispatch used by the scheduler and the tool-chain runner.
//! - [`ToolRegistry`]: in-process resolver; specs are resolved once at registration.
//! - [`FnTool`]: adapter turning an async closure into a [`Tool`].
//! - [`ToolChain`]: nested sequential / parallel call tree for direct dispatch without planning.

mod chain;
mod json;
mod registry;
mod r#trait;

pub use chain::{ChainError, ChainResult, ToolChain};
pub use json::extract_json;
pub use r#trait::{FnTool, Tool};
pub use registry::ToolRegistry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Description of a tool as shown to the planner.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: Option<String>,
    /// JSON schema of the arguments object. `required` is the only part checked at call time.
    pub input_schema: Value,
}

impl ToolSpec {
    /// Argument names listed under `required` in the schema.
    pub fn required_arguments(&self) -> Vec<String> {
        self.input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// One catalogue line for prompts: `name(arg, arg?) - description`.
    pub fn describe(&self) -> String {
        let required = self.required_arguments();
        let params: Vec<String> = self
            .input_schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| {
                props
                    .keys()
                    .map(|k| {
                        if required.contains(k) {
                            k.clone()
                        } else {
                            format!("{}?", k)
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        match &self.description {
            Some(d) => format!("{}({}) - {}", self.name, params.join(", "), d),
            None => format!("{}({})", self.name, params.join(", ")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("tool failed: {0}")]
    Execution(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("tool panicked: {0}")]
    Panicked(String),
}

/// Dispatches a tool call by name.
///
/// **Interaction**: Called by [`Scheduler`](crate::scheduler::Scheduler) once per dispatched
/// task, and by [`ToolChain::execute`]. [`specs`](ToolResolver::specs) feeds the planner's
/// tool catalogue.
#[async_trait]
pub trait ToolResolver: Send + Sync {
    async fn invoke(&self, name: &str, args: Value) -> Result<Value, ToolError>;

    fn specs(&self) -> Vec<ToolSpec>;
}
