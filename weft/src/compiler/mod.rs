//! The compile turn: plan, execute, join, and repeat until an answer or a limit.
//!
//! ```text
//! Planning ──► Executing ──► Joining ──► Done
//!    ▲             │            │
//!    └─────────────┴── replan ──┘        (any phase) ──► Failed
//! ```
//!
//! Planning spawns the [`PlanSource`] and hands its chunk stream to a [`PlanFeed`]; Executing
//! runs the [`Scheduler`] on that feed, so tool calls start while the plan is still being
//! written. A round whose plan is empty or breaks the numbering rules goes straight back to
//! Planning with synthetic feedback. `max_rounds` is checked before every planning request.
//!
//! The session is loaded under a per-thread lock, saved after every completed transition
//! back to Planning and at the terminal state, and never saved on cancellation.

mod outcome;
mod postprocess;

pub use outcome::{CompileOutcome, FailureReason};
pub use postprocess::{LlmSummarizer, Postprocessor, SummaryPolicy, COMPLETION_MARKER};

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument};

use crate::config::CompilerConfig;
use crate::error::CompileError;
use crate::graph::{BuildError, GraphBuilder, TaskGraph};
use crate::joiner::{DecisionSource, JoinDecision, JoinOutcome, JoinRequest, Joiner};
use crate::parser::PlanParser;
use crate::planner::{PlanRequest, PlanSource, PlanSourceError};
use crate::scheduler::{PlanFeed, ScheduleError, Scheduler};
use crate::session::{Session, SessionKey, SessionLocks, SessionStore};
use crate::stream::{emit, CompileEvent, EventSink};
use crate::task::TaskIndex;
use crate::tools::{ChainError, ToolChain, ToolResolver};

enum Phase {
    Planning,
    Executing {
        feed: PlanFeed,
        producer: JoinHandle<Result<(), PlanSourceError>>,
    },
    Joining {
        round_indices: Vec<TaskIndex>,
    },
    Done {
        answer: String,
    },
    Failed {
        reason: FailureReason,
    },
}

/// Turn-level entry point.
///
/// **Interaction**: Owns the [`Scheduler`] and [`Joiner`]; borrows plan text from a
/// [`PlanSource`], tools from a [`ToolResolver`], and state from a [`SessionStore`].
pub struct Compiler {
    config: CompilerConfig,
    planner: Arc<dyn PlanSource>,
    joiner: Joiner,
    tools: Arc<dyn ToolResolver>,
    scheduler: Scheduler,
    sessions: Arc<dyn SessionStore>,
    locks: SessionLocks,
    postprocessor: Option<Arc<dyn Postprocessor>>,
    events: Option<EventSink>,
}

impl Compiler {
    pub fn new(
        config: CompilerConfig,
        planner: Arc<dyn PlanSource>,
        decisions: Arc<dyn DecisionSource>,
        tools: Arc<dyn ToolResolver>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        let joiner = Joiner::new(decisions).with_max_attempts(config.join_attempts);
        let scheduler = Scheduler::new(Arc::clone(&tools), config.worker_pool_size);
        Self {
            config,
            planner,
            joiner,
            tools,
            scheduler,
            sessions,
            locks: SessionLocks::new(),
            postprocessor: None,
            events: None,
        }
    }

    pub fn with_postprocessor(mut self, postprocessor: Arc<dyn Postprocessor>) -> Self {
        self.postprocessor = Some(postprocessor);
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.scheduler = self.scheduler.with_events(events.clone());
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    pub async fn compile(
        &self,
        request: &str,
        key: &SessionKey,
    ) -> Result<CompileOutcome, CompileError> {
        self.compile_with_cancel(request, key, CancellationToken::new())
            .await
    }

    /// Like [`compile`](Self::compile); cancelling `cancel` aborts in-flight tool calls and
    /// the plan producer and returns [`CompileError::Cancelled`] without saving.
    pub async fn compile_with_cancel(
        &self,
        request: &str,
        key: &SessionKey,
        cancel: CancellationToken,
    ) -> Result<CompileOutcome, CompileError> {
        let span = info_span!("compile", user_id = %key.user_id, thread_id = %key.thread_id);
        self.run_turn(request, key, &cancel).instrument(span).await
    }

    /// Runs a JSON tool chain embedded in `text` directly, without planning.
    ///
    /// Returns `Ok(None)` when `text` holds no chain.
    pub async fn run_chain(&self, text: &str) -> Result<Option<String>, ChainError> {
        ToolChain::run_embedded(text, self.tools.as_ref(), self.config.max_chain_depth).await
    }

    async fn run_turn(
        &self,
        request: &str,
        key: &SessionKey,
        cancel: &CancellationToken,
    ) -> Result<CompileOutcome, CompileError> {
        let _turn = self.locks.acquire(key).await;
        let mut session = match self.sessions.load(key).await {
            Ok(Some(record)) => {
                Session::from_record(key.clone(), record).map_err(CompileError::SessionLoad)?
            }
            Ok(None) => Session::new(key.clone()),
            Err(e) => return Err(CompileError::SessionLoad(e)),
        };
        let turn_first_index = session.checkpoint.next_index;
        let turn_feedback_start = session.feedback_history().len();
        tracing::info!(next_index = turn_first_index, turn = session.checkpoint.turns + 1, "turn started");

        let mut rounds: u32 = 0;
        let mut phase = Phase::Planning;
        loop {
            if cancel.is_cancelled() {
                if let Phase::Executing { producer, .. } = &phase {
                    producer.abort();
                }
                return Err(CompileError::Cancelled);
            }
            phase = match phase {
                Phase::Planning => {
                    if rounds >= self.config.max_rounds {
                        tracing::warn!(rounds, "round cap reached");
                        Phase::Failed {
                            reason: FailureReason::ReplanLoopExceeded {
                                max_rounds: self.config.max_rounds,
                            },
                        }
                    } else {
                        rounds += 1;
                        let feedback = session.feedback_history()[turn_feedback_start..].to_vec();
                        self.start_round(request, &session, rounds, feedback)
                    }
                }
                Phase::Executing { feed, producer } => {
                    self.execute_round(&mut session, rounds, feed, producer, cancel)
                        .await?
                }
                Phase::Joining { round_indices } => {
                    let req = JoinRequest {
                        request,
                        context: &session.context,
                        round: rounds,
                        round_indices,
                        feedback_history: session.feedback_history(),
                    };
                    let joined = tokio::select! {
                        _ = cancel.cancelled() => return Err(CompileError::Cancelled),
                        joined = self.joiner.join(&req) => joined,
                    };
                    match joined {
                        Ok(JoinOutcome {
                            reasoning,
                            decision,
                        }) => {
                            emit(
                                &self.events,
                                CompileEvent::Joined {
                                    round: rounds,
                                    reasoning,
                                    replan: decision.is_replan(),
                                },
                            );
                            match decision {
                                JoinDecision::Final { text } => Phase::Done { answer: text },
                                JoinDecision::Replan {
                                    feedback,
                                    next_index,
                                } => {
                                    tracing::info!(round = rounds, next_index, "replanning");
                                    let checkpoint = &mut session.checkpoint;
                                    checkpoint.next_index = checkpoint.next_index.max(next_index);
                                    checkpoint.feedback_history.push(feedback);
                                    self.save(&session).await?;
                                    Phase::Planning
                                }
                            }
                        }
                        Err(e) => Phase::Failed {
                            reason: FailureReason::JoinDecision(e.to_string()),
                        },
                    }
                }
                Phase::Done { answer } => {
                    let answer = self.postprocess(request, answer, &session).await;
                    session.checkpoint.turns += 1;
                    session.checkpoint.last_answer = Some(answer.clone());
                    self.save(&session).await?;
                    tracing::info!(rounds, "turn finished");
                    emit(
                        &self.events,
                        CompileEvent::Finished {
                            rounds,
                            failed: false,
                        },
                    );
                    return Ok(CompileOutcome::Done { answer, rounds });
                }
                Phase::Failed { reason } => {
                    let partial_answer = session.context.partial_answer(turn_first_index);
                    session.checkpoint.turns += 1;
                    self.save(&session).await?;
                    tracing::warn!(rounds, reason = %reason, "turn failed");
                    emit(
                        &self.events,
                        CompileEvent::Finished {
                            rounds,
                            failed: true,
                        },
                    );
                    return Ok(CompileOutcome::Failed {
                        reason,
                        partial_answer,
                        rounds,
                    });
                }
            };
        }
    }

    /// Spawns the plan producer and wires its output into a fresh round.
    fn start_round(
        &self,
        request: &str,
        session: &Session,
        round: u32,
        feedback: Vec<String>,
    ) -> Phase {
        let next_index = session.checkpoint.next_index;
        tracing::info!(round, next_index, "planning");
        emit(&self.events, CompileEvent::RoundStarted { round, next_index });

        let (tx, rx) = mpsc::channel(self.config.plan_channel_capacity.max(1));
        let plan_request = PlanRequest {
            request: request.to_string(),
            next_index,
            round,
            feedback,
            observations: session.context.render_observations(1),
            tools: self.tools.specs(),
        };
        let planner = Arc::clone(&self.planner);
        let producer = tokio::spawn(
            async move { planner.generate(plan_request, tx).await }.in_current_span(),
        );
        let feed = PlanFeed::new(
            PlanParser::new(rx),
            GraphBuilder::new(next_index, self.config.max_tasks_per_round),
        );
        Phase::Executing { feed, producer }
    }

    async fn execute_round(
        &self,
        session: &mut Session,
        round: u32,
        mut feed: PlanFeed,
        producer: JoinHandle<Result<(), PlanSourceError>>,
        cancel: &CancellationToken,
    ) -> Result<Phase, CompileError> {
        let mut graph = TaskGraph::new();
        let result = self
            .scheduler
            .execute(&mut graph, Some(&mut feed), &mut session.context, round, cancel)
            .await;

        for skipped in feed.diagnostics() {
            emit(
                &self.events,
                CompileEvent::PlanLineSkipped {
                    line: skipped.line,
                    reason: skipped.reason.clone(),
                },
            );
        }
        // Indices handed out in an abandoned round stay burned.
        if let Some(highest) = graph.highest_index().max(feed.builder().highest_index()) {
            let checkpoint = &mut session.checkpoint;
            checkpoint.next_index = checkpoint.next_index.max(highest + 1);
        }

        let error = match result {
            Ok(report) => {
                tracing::info!(
                    round,
                    admitted = report.admitted,
                    succeeded = report.succeeded,
                    failed = report.failed,
                    "round executed"
                );
                finish_producer(producer).await;
                return Ok(Phase::Joining {
                    round_indices: graph.indices(),
                });
            }
            Err(ScheduleError::Cancelled) => {
                producer.abort();
                return Err(CompileError::Cancelled);
            }
            Err(ScheduleError::Build(BuildError::BudgetExceeded { limit })) => {
                producer.abort();
                return Ok(Phase::Failed {
                    reason: FailureReason::IterationBudgetExceeded { limit },
                });
            }
            Err(ScheduleError::Build(BuildError::EmptyPlan)) => match producer.await {
                Ok(Err(e)) => {
                    return Ok(Phase::Failed {
                        reason: FailureReason::PlanSource(e.to_string()),
                    })
                }
                Err(e) => {
                    return Ok(Phase::Failed {
                        reason: FailureReason::PlanSource(e.to_string()),
                    })
                }
                Ok(Ok(())) => BuildError::EmptyPlan,
            },
            Err(ScheduleError::Build(e)) => {
                producer.abort();
                e
            }
        };

        tracing::warn!(round, error = %error, "round abandoned");
        emit(
            &self.events,
            CompileEvent::RoundAbandoned {
                round,
                reason: error.to_string(),
            },
        );
        session
            .checkpoint
            .feedback_history
            .push(synthetic_feedback(&error, session.checkpoint.next_index));
        self.save(session).await?;
        Ok(Phase::Planning)
    }

    async fn postprocess(&self, request: &str, answer: String, session: &Session) -> String {
        let Some(postprocessor) = &self.postprocessor else {
            return answer;
        };
        match postprocessor.process(request, &answer, &session.context).await {
            Ok(processed) => processed,
            Err(e) => {
                tracing::warn!(error = %e, "postprocessing failed; keeping joiner answer");
                answer
            }
        }
    }

    async fn save(&self, session: &Session) -> Result<(), CompileError> {
        let record = session.to_record().map_err(CompileError::SessionSave)?;
        self.sessions
            .save(&session.key, &record)
            .await
            .map_err(CompileError::SessionSave)?;
        tracing::debug!(next_index = session.checkpoint.next_index, "session saved");
        Ok(())
    }
}

/// Feedback for a round whose plan could not be used.
fn synthetic_feedback(error: &BuildError, next_index: TaskIndex) -> String {
    match error {
        BuildError::EmptyPlan => format!(
            "The previous plan contained no actions. Write a plan of numbered tool calls \
             ending with join(), starting at index {}.",
            next_index
        ),
        other => format!(
            "The previous plan was invalid ({}). Each action may only reference actions with a \
             smaller index. Write a corrected plan starting at index {}.",
            other, next_index
        ),
    }
}

/// Logs a producer failure if the producer already ended; otherwise stops it.
async fn finish_producer(producer: JoinHandle<Result<(), PlanSourceError>>) {
    if !producer.is_finished() {
        producer.abort();
        return;
    }
    match producer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "plan stream ended with an error"),
        Err(e) => tracing::warn!(error = %e, "plan producer task failed"),
    }
}
