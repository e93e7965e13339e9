//! In-process capability registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::{Tool, ToolError, ToolResolver, ToolSpec};

struct Registered {
    tool: Arc<dyn Tool>,
    spec: ToolSpec,
    required: Vec<String>,
}

/// Tools by name. Specs and required-argument lists are captured when a tool is registered,
/// so dispatch is a map lookup plus a key-presence check.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Registered>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `tool`, replacing (and returning) any tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Option<Arc<dyn Tool>> {
        let spec = tool.spec();
        let required = spec.required_arguments();
        let name = tool.name().to_string();
        tracing::debug!(tool = %name, "tool registered");
        self.tools
            .insert(
                name,
                Registered {
                    tool,
                    spec,
                    required,
                },
            )
            .map(|old| old.tool)
    }

    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register(Arc::new(tool));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

#[async_trait]
impl ToolResolver for ToolRegistry {
    async fn invoke(&self, name: &str, args: Value) -> Result<Value, ToolError> {
        let entry = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        let Some(object) = args.as_object() else {
            return Err(ToolError::InvalidInput(format!(
                "arguments for `{}` must be an object",
                name
            )));
        };
        if let Some(missing) = entry.required.iter().find(|k| !object.contains_key(*k)) {
            return Err(ToolError::InvalidInput(format!(
                "`{}` is missing required argument `{}`",
                name, missing
            )));
        }
        entry.tool.call(args).await
    }

    fn specs(&self) -> Vec<ToolSpec> {
        self.tools.values().map(|r| r.spec.clone()).collect()
    }
}
