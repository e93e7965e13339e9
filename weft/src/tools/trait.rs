use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::tools::{ToolError, ToolSpec};

/// A single capability the planner can call by name.
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use serde_json::{json, Value};
/// use weft::tools::{Tool, ToolError, ToolSpec};
///
/// struct Echo;
///
/// #[async_trait]
/// impl Tool for Echo {
///     fn name(&self) -> &str {
///         "echo"
///     }
///
///     fn spec(&self) -> ToolSpec {
///         ToolSpec {
///             name: "echo".into(),
///             description: Some("returns its input".into()),
///             input_schema: json!({"type": "object", "required": ["text"]}),
///         }
///     }
///
///     async fn call(&self, args: Value) -> Result<Value, ToolError> {
///         Ok(args["text"].clone())
///     }
/// }
/// ```
///
/// **Interaction**: Registered in [`ToolRegistry`](crate::tools::ToolRegistry), which checks
/// required arguments before calling.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name within a registry; the name plans refer to.
    fn name(&self) -> &str;

    fn spec(&self) -> ToolSpec;

    /// Runs the tool on the substituted arguments object.
    async fn call(&self, args: Value) -> Result<Value, ToolError>;
}

type ToolFn = dyn Fn(Value) -> BoxFuture<'static, Result<Value, ToolError>> + Send + Sync;

/// A [`Tool`] backed by an async closure.
#[derive(Clone)]
pub struct FnTool {
    spec: ToolSpec,
    f: Arc<ToolFn>,
}

impl FnTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        f: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        Self {
            spec: ToolSpec {
                name: name.into(),
                description: Some(description.into()),
                input_schema,
            },
            f: Arc::new(move |args| -> BoxFuture<'static, Result<Value, ToolError>> {
                Box::pin(f(args))
            }),
        }
    }
}

impl std::fmt::Debug for FnTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTool").field("name", &self.spec.name).finish()
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn spec(&self) -> ToolSpec {
        self.spec.clone()
    }

    async fn call(&self, args: Value) -> Result<Value, ToolError> {
        (self.f)(args).await
    }
}
