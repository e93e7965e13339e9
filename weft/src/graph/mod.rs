//! Task graph of one round: tasks keyed by index, edges from `$N` references.
//!
//! [`GraphBuilder`] admits parsed tasks one by one (renumbering and validating them);
//! [`TaskGraph`] holds the admitted tasks and answers "what can run now".

mod builder;

pub use builder::GraphBuilder;

use std::collections::BTreeMap;

use thiserror::Error;

use crate::context::ExecutionContext;
use crate::task::{Task, TaskIndex, TaskOutcome, TaskStatus};

/// A reference that breaks the ordering rules; the round is abandoned and replanned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DependencyViolation {
    #[error("task {index} references ${reference}, which is not an earlier task")]
    ForwardReference {
        index: TaskIndex,
        reference: TaskIndex,
    },
    #[error("task {index} references ${reference}, which does not exist")]
    UnknownReference {
        index: TaskIndex,
        reference: TaskIndex,
    },
    #[error("task index {index} does not come after {previous}")]
    NonIncreasingIndex {
        index: TaskIndex,
        previous: TaskIndex,
    },
    #[error("join task {index} must depend on every task of its round")]
    IncompleteJoin { index: TaskIndex },
    #[error("tasks {pending:?} can never become ready")]
    Unsatisfiable { pending: Vec<TaskIndex> },
}

/// Why a round's graph could not be built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("the plan contained no tasks")]
    EmptyPlan,
    #[error(transparent)]
    Dependency(#[from] DependencyViolation),
    #[error("plan exceeds {limit} tasks in one round")]
    BudgetExceeded { limit: usize },
}

/// Tasks of the current round, ordered by index.
#[derive(Debug, Default)]
pub struct TaskGraph {
    tasks: BTreeMap<TaskIndex, Task>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a graph from already-admitted tasks.
    pub fn from_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        Self {
            tasks: tasks.into_iter().map(|t| (t.index, t)).collect(),
        }
    }

    /// Adds a task. Returns `false` (and keeps the existing one) if the index is taken.
    pub fn insert(&mut self, task: Task) -> bool {
        if self.tasks.contains_key(&task.index) {
            return false;
        }
        self.tasks.insert(task.index, task);
        true
    }

    pub fn get(&self, index: TaskIndex) -> Option<&Task> {
        self.tasks.get(&index)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn indices(&self) -> Vec<TaskIndex> {
        self.tasks.keys().copied().collect()
    }

    pub fn highest_index(&self) -> Option<TaskIndex> {
        self.tasks.keys().next_back().copied()
    }

    pub fn join_index(&self) -> Option<TaskIndex> {
        self.tasks.values().find(|t| t.is_join()).map(|t| t.index)
    }

    fn dependency_resolved(&self, dep: TaskIndex, context: &ExecutionContext) -> bool {
        context.contains(dep)
            || self
                .tasks
                .get(&dep)
                .is_some_and(|t| t.status.is_resolved())
    }

    /// Pending or ready tasks whose dependencies have all resolved, in index order.
    pub fn frontier(&self, context: &ExecutionContext) -> Vec<TaskIndex> {
        self.tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Ready))
            .filter(|t| {
                t.dependencies
                    .iter()
                    .all(|d| self.dependency_resolved(*d, context))
            })
            .map(|t| t.index)
            .collect()
    }

    pub fn set_status(&mut self, index: TaskIndex, status: TaskStatus) {
        if let Some(t) = self.tasks.get_mut(&index) {
            t.status = status;
        }
    }

    /// Resolves a task. Already resolved tasks keep their first outcome.
    pub fn complete(&mut self, index: TaskIndex, outcome: Option<TaskOutcome>) {
        if let Some(t) = self.tasks.get_mut(&index) {
            if t.status.is_resolved() {
                return;
            }
            t.status = outcome
                .as_ref()
                .map_or(TaskStatus::Done, TaskOutcome::status);
            t.result = outcome;
        }
    }

    pub fn unresolved(&self) -> Vec<TaskIndex> {
        self.tasks
            .values()
            .filter(|t| !t.status.is_resolved())
            .map(|t| t.index)
            .collect()
    }

    pub fn is_resolved(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_resolved())
    }

    /// Checks the ordering rules on a complete graph: every dependency is an earlier task of
    /// this graph or of the context, and the join (if any) is last and waits on every task.
    pub fn validate(&self, context: &ExecutionContext) -> Result<(), DependencyViolation> {
        for task in self.tasks.values() {
            for &dep in &task.dependencies {
                if dep >= task.index {
                    return Err(DependencyViolation::ForwardReference {
                        index: task.index,
                        reference: dep,
                    });
                }
                if !self.tasks.contains_key(&dep) && !context.contains(dep) {
                    return Err(DependencyViolation::UnknownReference {
                        index: task.index,
                        reference: dep,
                    });
                }
            }
        }
        if let Some(join) = self.join_index() {
            let tools = self.tasks.values().filter(|t| !t.is_join());
            let complete = self.highest_index() == Some(join)
                && self
                    .get(join)
                    .is_some_and(|j| tools.clone().all(|t| j.dependencies.contains(&t.index)));
            if !complete {
                return Err(DependencyViolation::IncompleteJoin { index: join });
            }
        }
        Ok(())
    }
}
