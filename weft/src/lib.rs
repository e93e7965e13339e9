//! # weft
//!
//! A streaming plan compiler: a model writes a numbered plan of tool calls, and weft runs
//! the calls as soon as each line is complete, in parallel where the `$N` references allow,
//! then asks a joiner whether the results answer the request or another round is needed.
//!
//! ## Pipeline
//!
//! ```text
//! PlanSource ─chunks─► PlanParser ─ParsedTask─► GraphBuilder ─Task─► Scheduler ─► Joiner
//!     ▲                                                                              │
//!     └──────────────────────── replan feedback, next index ◄───────────────────────┘
//! ```
//!
//! - [`parser`]: line grammar `N. tool(arg=value, ...)`, `join()`, `Thought:` lines; pull-based
//!   and cancel-safe over a bounded channel.
//! - [`graph`]: [`GraphBuilder`] renumbers and validates tasks as they arrive; [`TaskGraph`]
//!   answers "what can run now".
//! - [`scheduler`]: [`Scheduler`] dispatches the frontier to a [`ToolResolver`] under a worker
//!   bound, substituting references from the [`ExecutionContext`] just before each call.
//! - [`joiner`]: [`Joiner`] validates `{reasoning, action}` decisions and computes the next
//!   round's first index.
//! - [`compiler`]: [`Compiler`] drives Planning → Executing → Joining with a round cap and
//!   persists the thread through a [`SessionStore`].
//!
//! Supporting modules: [`tools`] (registry, closures, tool chains), [`planner`] (LLM plan
//! source), [`llm`] ([`LlmClient`], [`MockLlm`], [`ChatOpenAI`]), [`session`] (in-memory and
//! SQLite stores), [`stream`] (chunks and progress events), [`config`] ([`CompilerConfig`]).
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use serde_json::{json, Value};
//! use weft::{
//!     Compiler, CompilerConfig, FnTool, InMemorySessionStore, LlmDecisionSource, LlmPlanSource,
//!     MockLlm, SessionKey, ToolError, ToolRegistry,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let tools = ToolRegistry::new().with(FnTool::new(
//!     "search",
//!     "web search",
//!     json!({"properties": {"query": {}}, "required": ["query"]}),
//!     |args: Value| async move { Ok::<_, ToolError>(json!(format!("results for {}", args["query"]))) },
//! ));
//! let planner = MockLlm::with_reply("1. search(query=\"capital of France\")\n2. join()\n");
//! let joiner = MockLlm::with_reply(r#"{"thought": "found it", "action": {"response": "Paris"}}"#);
//!
//! let compiler = Compiler::new(
//!     CompilerConfig::default(),
//!     Arc::new(LlmPlanSource::new(Arc::new(planner))),
//!     Arc::new(LlmDecisionSource::new(Arc::new(joiner))),
//!     Arc::new(tools),
//!     Arc::new(InMemorySessionStore::new()),
//! );
//! let outcome = compiler
//!     .compile("What is the capital of France?", &SessionKey::new_thread("alice"))
//!     .await?;
//! println!("{}", outcome.to_text());
//! # Ok(())
//! # }
//! ```

pub mod compiler;
pub mod config;
pub mod context;
pub mod error;
pub mod graph;
pub mod joiner;
pub mod llm;
pub mod message;
pub mod parser;
pub mod planner;
pub mod scheduler;
pub mod session;
pub mod stream;
pub mod task;
pub mod tools;

pub use compiler::{
    CompileOutcome, Compiler, FailureReason, LlmSummarizer, Postprocessor, SummaryPolicy,
};
pub use config::{CompilerConfig, ConfigError};
pub use context::{ContextEntry, ExecutionContext};
pub use error::CompileError;
pub use graph::{BuildError, DependencyViolation, GraphBuilder, TaskGraph};
pub use joiner::{
    DecisionSource, JoinAction, JoinDecision, JoinDecisionError, JoinOutcome, JoinRequest,
    Joiner, LlmDecisionSource, RawJoinOutput,
};
pub use llm::{ChatOpenAI, LlmClient, LlmError, LlmResponse, MockLlm};
pub use message::Message;
pub use parser::{parse_plan, ParsedTask, PlanParseError, PlanParser};
pub use planner::{LlmPlanSource, PlanRequest, PlanSource, PlanSourceError};
pub use scheduler::{ExecutionReport, PlanFeed, ScheduleError, Scheduler};
pub use session::{
    InMemorySessionStore, Session, SessionError, SessionKey, SessionLocks, SessionRecord,
    SessionStore, SqliteSessionStore, ThreadInfo, TurnCheckpoint, TurnGuard,
};
pub use stream::{CompileEvent, EventSink, MessageChunk};
pub use task::{ArgValue, Arguments, Task, TaskIndex, TaskKind, TaskOutcome, TaskStatus};
pub use tools::{
    ChainError, ChainResult, FnTool, Tool, ToolChain, ToolError, ToolRegistry, ToolResolver,
    ToolSpec,
};

/// When running `cargo test -p weft`, initializes tracing from `RUST_LOG` so that unit tests
/// in `src/**` can print logs with `--nocapture`.
#[cfg(test)]
mod test_logging {
    use ctor::ctor;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::Layer;

    #[ctor]
    fn init() {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_filter(filter),
            )
            .try_init();
    }
}
