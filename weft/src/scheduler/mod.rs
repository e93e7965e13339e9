//! Executes a round's task graph with bounded parallelism.
//!
//! The loop alternates three event sources in one `tokio::select!`: cancellation, tool
//! completions from a [`JoinSet`], and newly admitted tasks from a streaming [`PlanFeed`].
//! After every event the frontier is recomputed and dispatched as worker permits allow.
//! References are substituted from the [`ExecutionContext`] right before a task is spawned.

mod feed;

pub use feed::PlanFeed;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::context::{ContextEntry, ExecutionContext};
use crate::graph::{BuildError, DependencyViolation, TaskGraph};
use crate::parser::ParsedTask;
use crate::stream::{emit, CompileEvent, EventSink};
use crate::task::{TaskIndex, TaskOutcome, TaskStatus};
use crate::tools::{ToolError, ToolResolver};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error("execution cancelled")]
    Cancelled,
}

impl From<DependencyViolation> for ScheduleError {
    fn from(v: DependencyViolation) -> Self {
        Self::Build(BuildError::Dependency(v))
    }
}

/// Counts for one [`Scheduler::execute`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    /// Tasks admitted from the feed.
    pub admitted: usize,
    /// Tool invocations started.
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
}

struct Completion {
    index: TaskIndex,
    tool: String,
    arguments: Value,
    result: Result<Value, ToolError>,
}

/// Dispatches tool tasks to a [`ToolResolver`].
///
/// **Interaction**: Owned by the [`Compiler`](crate::compiler::Compiler); one
/// [`execute`](Scheduler::execute) call per round.
pub struct Scheduler {
    resolver: Arc<dyn ToolResolver>,
    pool_size: usize,
    events: Option<EventSink>,
}

impl Scheduler {
    pub fn new(resolver: Arc<dyn ToolResolver>, pool_size: usize) -> Self {
        Self {
            resolver,
            pool_size: pool_size.max(1),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Runs `graph` (and whatever `feed` still admits into it) until every task is resolved.
    ///
    /// Every finished tool call is recorded in `context` under `round`. Tool errors become
    /// failed outcomes. Returns an error when admission breaks the ordering rules or the
    /// round budget, when the graph can never finish, or on cancellation; in-flight calls are
    /// aborted in all three cases. A graph with nothing left to run performs no invocations.
    pub async fn execute(
        &self,
        graph: &mut TaskGraph,
        mut feed: Option<&mut PlanFeed>,
        context: &mut ExecutionContext,
        round: u32,
        cancel: &CancellationToken,
    ) -> Result<ExecutionReport, ScheduleError> {
        if feed.is_none() {
            graph.validate(context)?;
        }
        let permits = Arc::new(Semaphore::new(self.pool_size));
        let mut running: JoinSet<Completion> = JoinSet::new();
        let mut report = ExecutionReport::default();
        let mut feed_open = feed.is_some();

        loop {
            self.dispatch_frontier(graph, context, &permits, &mut running, &mut report);
            if !feed_open && running.is_empty() {
                if graph.is_resolved() {
                    return Ok(report);
                }
                let pending = graph.unresolved();
                tracing::warn!(round, ?pending, "graph stalled");
                return Err(DependencyViolation::Unsatisfiable { pending }.into());
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(round, in_flight = running.len(), "execution cancelled");
                    running.abort_all();
                    return Err(ScheduleError::Cancelled);
                }
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    match joined {
                        Ok(done) => self.record(done, graph, context, round, &mut report),
                        Err(e) => tracing::warn!(round, error = %e, "tool task aborted"),
                    }
                }
                parsed = pull(feed.as_deref_mut()), if feed_open => {
                    let admitted = match (parsed, feed.as_deref_mut()) {
                        (Some(parsed), Some(feed)) => feed.admit(parsed, context),
                        (None, Some(feed)) => {
                            feed_open = false;
                            feed.finish()
                        }
                        (_, None) => Ok(None),
                    };
                    match admitted {
                        Ok(Some(task)) => {
                            tracing::debug!(round, index = task.index, task = %task, "task admitted");
                            emit(&self.events, CompileEvent::TaskAdmitted {
                                index: task.index,
                                tool: task.tool_name().map(str::to_string),
                                dependencies: task.dependencies.iter().copied().collect(),
                            });
                            graph.insert(task);
                            report.admitted += 1;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(round, error = %e, "round abandoned during admission");
                            running.abort_all();
                            return Err(e.into());
                        }
                    }
                }
            }
        }
    }

    /// Resolves ready joins in place and spawns ready tool tasks while permits last.
    fn dispatch_frontier(
        &self,
        graph: &mut TaskGraph,
        context: &ExecutionContext,
        permits: &Arc<Semaphore>,
        running: &mut JoinSet<Completion>,
        report: &mut ExecutionReport,
    ) {
        for index in graph.frontier(context) {
            let Some(task) = graph.get(index) else {
                continue;
            };
            let Some(tool) = task.tool_name().map(str::to_string) else {
                tracing::debug!(index, "join resolved");
                graph.complete(index, None);
                emit(&self.events, CompileEvent::TaskResolved { index, failed: false });
                continue;
            };
            let arguments = match task.arguments.resolve(|i| context.outcome(i)) {
                Ok(args) => args,
                Err(missing) => {
                    let outcome =
                        TaskOutcome::Failed(format!("reference ${} has no result", missing));
                    tracing::warn!(index, missing, "unresolvable reference at dispatch");
                    graph.complete(index, Some(outcome));
                    report.failed += 1;
                    emit(&self.events, CompileEvent::TaskResolved { index, failed: true });
                    continue;
                }
            };
            let Ok(permit) = Arc::clone(permits).try_acquire_owned() else {
                graph.set_status(index, TaskStatus::Ready);
                continue;
            };

            graph.set_status(index, TaskStatus::Running);
            report.dispatched += 1;
            tracing::debug!(index, tool = %tool, "dispatching");
            emit(
                &self.events,
                CompileEvent::TaskDispatched {
                    index,
                    tool: tool.clone(),
                },
            );
            let resolver = Arc::clone(&self.resolver);
            running.spawn(async move {
                let _permit = permit;
                let result = AssertUnwindSafe(resolver.invoke(&tool, arguments.clone()))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(ToolError::Panicked(panic_message(&*panic))));
                Completion {
                    index,
                    tool,
                    arguments,
                    result,
                }
            });
        }
    }

    fn record(
        &self,
        done: Completion,
        graph: &mut TaskGraph,
        context: &mut ExecutionContext,
        round: u32,
        report: &mut ExecutionReport,
    ) {
        let outcome = match done.result {
            Ok(value) => {
                report.succeeded += 1;
                TaskOutcome::Done(value)
            }
            Err(e) => {
                tracing::warn!(index = done.index, tool = %done.tool, error = %e, "tool call failed");
                report.failed += 1;
                TaskOutcome::Failed(e.to_string())
            }
        };
        let failed = outcome.is_failure();
        context.record(ContextEntry {
            index: done.index,
            round,
            tool: done.tool,
            arguments: done.arguments,
            outcome: outcome.clone(),
        });
        graph.complete(done.index, Some(outcome));
        emit(
            &self.events,
            CompileEvent::TaskResolved {
                index: done.index,
                failed,
            },
        );
    }
}

async fn pull(feed: Option<&mut PlanFeed>) -> Option<ParsedTask> {
    match feed {
        Some(feed) => feed.next_parsed().await,
        None => std::future::pending().await,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::parser::PlanParser;
    use crate::stream::MessageChunk;
    use crate::task::{ArgValue, Arguments, Task};
    use crate::tools::{FnTool, ToolRegistry};
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn registry(calls: Arc<AtomicUsize>) -> Arc<ToolRegistry> {
        let echo_calls = Arc::clone(&calls);
        Arc::new(
            ToolRegistry::new()
                .with(FnTool::new("echo", "echo", json!({}), move |args: Value| {
                    let calls = Arc::clone(&echo_calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, ToolError>(args["v"].clone())
                    }
                }))
                .with(FnTool::new("fail", "always fails", json!({}), |_args: Value| async {
                    Err::<Value, _>(ToolError::Execution("boom".into()))
                }))
                .with(FnTool::new("panic", "panics", json!({}), |args: Value| async move {
                    if args.is_object() {
                        panic!("tool blew up");
                    }
                    Ok::<_, ToolError>(json!(null))
                })),
        )
    }

    fn echo(index: TaskIndex, v: ArgValue) -> Task {
        Task::tool(index, "echo", Arguments::new().with("v", v))
    }

    #[tokio::test]
    async fn references_are_substituted_before_dispatch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(registry(calls.clone()), 4);
        let mut graph = TaskGraph::from_tasks([
            echo(1, ArgValue::Literal(json!("paris"))),
            echo(2, ArgValue::Reference(1)),
            echo(3, ArgValue::string("weather in ${2}")),
            Task::join(4, BTreeSet::from([1, 2, 3])),
        ]);
        let mut ctx = ExecutionContext::new();
        let report = scheduler
            .execute(&mut graph, None, &mut ctx, 1, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.dispatched, 3);
        assert_eq!(ctx.outcome(2), Some(TaskOutcome::Done(json!("paris"))));
        assert_eq!(ctx.outcome(3), Some(TaskOutcome::Done(json!("weather in paris"))));
        assert_eq!(graph.get(4).unwrap().status, TaskStatus::Done);
        assert!(!ctx.contains(4));
    }

    /// **Scenario**: tool errors and panics become failed outcomes; dependents still run.
    #[tokio::test]
    async fn failures_are_data() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(registry(calls), 2);
        let mut graph = TaskGraph::from_tasks([
            Task::tool(1, "fail", Arguments::new()),
            Task::tool(2, "panic", Arguments::new()),
            echo(3, ArgValue::Reference(1)),
            Task::tool(4, "missing", Arguments::new()),
            Task::join(5, BTreeSet::from([1, 2, 3, 4])),
        ]);
        let mut ctx = ExecutionContext::new();
        let report = scheduler
            .execute(&mut graph, None, &mut ctx, 1, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.failed, 3);
        assert_eq!(report.succeeded, 1);
        assert_eq!(
            ctx.outcome(1),
            Some(TaskOutcome::Failed("tool failed: boom".into()))
        );
        assert_eq!(
            ctx.outcome(2),
            Some(TaskOutcome::Failed("tool panicked: tool blew up".into()))
        );
        assert_eq!(
            ctx.outcome(3),
            Some(TaskOutcome::Done(json!("error: tool failed: boom")))
        );
        assert!(graph.is_resolved());
    }

    #[tokio::test]
    async fn resolved_graph_is_not_rerun() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(registry(calls.clone()), 4);
        let mut graph = TaskGraph::from_tasks([
            echo(1, ArgValue::Literal(json!(1))),
            Task::join(2, BTreeSet::from([1])),
        ]);
        let mut ctx = ExecutionContext::new();
        let cancel = CancellationToken::new();
        scheduler.execute(&mut graph, None, &mut ctx, 1, &cancel).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let again = scheduler.execute(&mut graph, None, &mut ctx, 1, &cancel).await.unwrap();
        assert_eq!(again, ExecutionReport::default());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pool_size_bounds_concurrency() {
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (l, p) = (live.clone(), peak.clone());
        let slow = FnTool::new("slow", "sleeps", json!({}), move |_args: Value| {
            let (live, peak) = (l.clone(), p.clone());
            async move {
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                live.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, ToolError>(json!(null))
            }
        });
        let scheduler = Scheduler::new(Arc::new(ToolRegistry::new().with(slow)), 2);
        let mut tasks: Vec<Task> = (1..=6).map(|i| Task::tool(i, "slow", Arguments::new())).collect();
        tasks.push(Task::join(7, (1..=6).collect()));
        let mut graph = TaskGraph::from_tasks(tasks);
        let mut ctx = ExecutionContext::new();
        let report = scheduler
            .execute(&mut graph, None, &mut ctx, 1, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.succeeded, 6);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn streaming_feed_starts_before_plan_ends() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(registry(calls.clone()), 4);
        let (tx, rx) = mpsc::channel(8);
        let mut feed = PlanFeed::new(PlanParser::new(rx), GraphBuilder::new(1, 8));
        let producer = {
            let calls = calls.clone();
            tokio::spawn(async move {
                tx.send(MessageChunk::new("1. echo(v=\"a\")\n")).await.unwrap();
                for _ in 0..100 {
                    if calls.load(Ordering::SeqCst) == 1 {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                let seen = calls.load(Ordering::SeqCst);
                tx.send(MessageChunk::new("2. echo(v=$1)\n3. join()\n")).await.unwrap();
                seen
            })
        };
        let mut graph = TaskGraph::new();
        let mut ctx = ExecutionContext::new();
        let report = scheduler
            .execute(&mut graph, Some(&mut feed), &mut ctx, 1, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(producer.await.unwrap(), 1, "task 1 ran while the plan was streaming");
        assert_eq!(report.admitted, 3);
        assert_eq!(ctx.outcome(2), Some(TaskOutcome::Done(json!("a"))));
    }

    #[tokio::test]
    async fn admission_violation_abandons_round() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(registry(calls), 4);
        let (tx, rx) = mpsc::channel(8);
        tx.send(MessageChunk::new("1. echo(v=$2)\n2. join()\n")).await.unwrap();
        drop(tx);
        let mut feed = PlanFeed::new(PlanParser::new(rx), GraphBuilder::new(1, 8));
        let err = scheduler
            .execute(
                &mut TaskGraph::new(),
                Some(&mut feed),
                &mut ExecutionContext::new(),
                1,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ScheduleError::Build(BuildError::Dependency(
                DependencyViolation::ForwardReference { .. }
            ))
        ));
    }

    #[tokio::test]
    async fn empty_feed_is_empty_plan() {
        let scheduler = Scheduler::new(registry(Arc::new(AtomicUsize::new(0))), 4);
        let (tx, rx) = mpsc::channel(8);
        tx.send(MessageChunk::new("I cannot help with that.\n")).await.unwrap();
        drop(tx);
        let mut feed = PlanFeed::new(PlanParser::new(rx), GraphBuilder::new(1, 8));
        let err = scheduler
            .execute(
                &mut TaskGraph::new(),
                Some(&mut feed),
                &mut ExecutionContext::new(),
                1,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err, ScheduleError::Build(BuildError::EmptyPlan));
        assert_eq!(feed.diagnostics().len(), 1);
    }

    #[tokio::test]
    async fn cancellation_aborts_in_flight_calls() {
        let never = FnTool::new("hang", "never returns", json!({}), |_args: Value| async {
            std::future::pending::<()>().await;
            Ok::<_, ToolError>(json!(null))
        });
        let scheduler = Scheduler::new(Arc::new(ToolRegistry::new().with(never)), 4);
        let mut graph = TaskGraph::from_tasks([
            Task::tool(1, "hang", Arguments::new()),
            Task::join(2, BTreeSet::from([1])),
        ]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let mut ctx = ExecutionContext::new();
        let err = scheduler
            .execute(&mut graph, None, &mut ctx, 1, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, ScheduleError::Cancelled);
        assert!(ctx.is_empty());
    }
}
