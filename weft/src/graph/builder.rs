//! Admits parsed tasks into a round, one at a time, while the plan is still streaming.
//!
//! Numbering: the round must start at `first_index` (one past everything used before). When
//! the model numbers from somewhere else (typically restarting at 1 after a replan), the whole
//! round is shifted so its first task lands on `first_index`; references into the round move
//! with it, references below the round's first declared index keep pointing at earlier rounds.
//!
//! **Interaction**: Fed by [`PlanParser`](crate::parser::PlanParser) through
//! [`PlanFeed`](crate::scheduler::PlanFeed); resolves earlier-round references against the
//! [`ExecutionContext`].

use std::collections::BTreeSet;

use crate::context::ExecutionContext;
use crate::graph::{BuildError, DependencyViolation};
use crate::parser::ParsedTask;
use crate::task::{Task, TaskIndex, TaskKind};

#[derive(Debug)]
pub struct GraphBuilder {
    first_index: TaskIndex,
    max_tasks: usize,
    /// `first_index - declared index of the first task`, fixed by the first numbered task.
    shift: Option<i64>,
    declared_first: Option<TaskIndex>,
    last_index: Option<TaskIndex>,
    round_tools: BTreeSet<TaskIndex>,
    admitted: usize,
    closed: bool,
}

impl GraphBuilder {
    pub fn new(first_index: TaskIndex, max_tasks: usize) -> Self {
        Self {
            first_index,
            max_tasks,
            shift: None,
            declared_first: None,
            last_index: None,
            round_tools: BTreeSet::new(),
            admitted: 0,
            closed: false,
        }
    }

    pub fn first_index(&self) -> TaskIndex {
        self.first_index
    }

    /// Highest index handed out in this round (join included).
    pub fn highest_index(&self) -> Option<TaskIndex> {
        self.last_index
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Tool tasks admitted so far.
    pub fn tool_count(&self) -> usize {
        self.round_tools.len()
    }

    fn next_free(&self) -> TaskIndex {
        self.last_index.map_or(self.first_index, |i| i + 1)
    }

    fn translate(&mut self, declared: TaskIndex) -> Result<TaskIndex, DependencyViolation> {
        if self.shift.is_none() {
            self.declared_first = Some(declared);
            self.shift = Some(i64::from(self.first_index) - i64::from(declared));
        }
        let translated = i64::from(declared) + self.shift.unwrap_or(0);
        let in_order = |index: TaskIndex| match self.last_index {
            Some(prev) => index > prev,
            None => index >= self.first_index,
        };
        match TaskIndex::try_from(translated) {
            Ok(index) if in_order(index) => Ok(index),
            _ => Err(DependencyViolation::NonIncreasingIndex {
                index: declared,
                previous: self
                    .last_index
                    .unwrap_or(self.first_index.saturating_sub(1)),
            }),
        }
    }

    /// Admits the next parsed task and returns it renumbered, with dependencies derived.
    ///
    /// Returns `Ok(None)` for anything arriving after the round's join.
    pub fn admit(
        &mut self,
        parsed: ParsedTask,
        context: &ExecutionContext,
    ) -> Result<Option<Task>, BuildError> {
        if self.closed {
            tracing::warn!(line = parsed.line, "task after join ignored");
            return Ok(None);
        }
        let name = match parsed.kind {
            TaskKind::Join => return Ok(Some(self.join_task(parsed.thought))),
            TaskKind::Tool { name } => name,
        };
        if self.round_tools.len() >= self.max_tasks {
            return Err(BuildError::BudgetExceeded {
                limit: self.max_tasks,
            });
        }

        let index = match parsed.index {
            Some(declared) => self.translate(declared)?,
            None => self.next_free(),
        };
        let shift = self.shift.unwrap_or(0);
        let declared_first = self.declared_first.unwrap_or(index);
        let declared_own = parsed.index.unwrap_or(index);
        let round_tools = &self.round_tools;

        let arguments = parsed.arguments.remap(|reference| {
            if reference >= declared_own {
                return Err(DependencyViolation::ForwardReference {
                    index,
                    reference,
                });
            }
            if reference >= declared_first {
                let target = TaskIndex::try_from(i64::from(reference) + shift).ok();
                return match target {
                    Some(t) if round_tools.contains(&t) => Ok(t),
                    _ => Err(DependencyViolation::UnknownReference { index, reference }),
                };
            }
            if context.contains(reference) {
                Ok(reference)
            } else {
                Err(DependencyViolation::UnknownReference { index, reference })
            }
        })?;

        let mut task = Task::tool(index, name, arguments);
        task.thought = parsed.thought;
        self.last_index = Some(index);
        self.round_tools.insert(index);
        self.admitted += 1;
        Ok(Some(task))
    }

    /// The join is numbered right after the round's last task and waits on all of them.
    fn join_task(&mut self, thought: Option<String>) -> Task {
        let index = self.next_free();
        let mut join = Task::join(index, self.round_tools.clone());
        join.thought = thought;
        self.last_index = Some(index);
        self.admitted += 1;
        self.closed = true;
        join
    }

    /// Ends the round. Appends a join if the plan never wrote one.
    ///
    /// Fails with [`BuildError::EmptyPlan`] when nothing was admitted.
    pub fn close(&mut self) -> Result<Option<Task>, BuildError> {
        if self.admitted == 0 {
            return Err(BuildError::EmptyPlan);
        }
        if self.closed {
            return Ok(None);
        }
        tracing::debug!(first_index = self.first_index, "plan ended without join; appending one");
        Ok(Some(self.join_task(None)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextEntry;
    use crate::parser::parse_plan;
    use crate::task::{ArgValue, TaskOutcome};
    use serde_json::json;

    fn build(
        text: &str,
        first: TaskIndex,
        ctx: &ExecutionContext,
    ) -> Result<Vec<Task>, BuildError> {
        let (parsed, _) = parse_plan(text);
        let mut b = GraphBuilder::new(first, 16);
        let mut out = Vec::new();
        for p in parsed {
            if let Some(t) = b.admit(p, ctx)? {
                out.push(t);
            }
        }
        if let Some(j) = b.close()? {
            out.push(j);
        }
        Ok(out)
    }

    fn ctx_with(indices: &[TaskIndex]) -> ExecutionContext {
        let mut ctx = ExecutionContext::new();
        for &i in indices {
            ctx.record(ContextEntry {
                index: i,
                round: 1,
                tool: "t".into(),
                arguments: json!({}),
                outcome: TaskOutcome::Done(json!(i)),
            });
        }
        ctx
    }

    #[test]
    fn dependencies_come_from_references() {
        let tasks = build(
            "1. a(x=1)\n2. b(y=2)\n3. c(p=$1, q=\"${2} and $1\")\n4. join()\n",
            1,
            &ExecutionContext::new(),
        )
        .unwrap();
        assert_eq!(tasks[2].dependencies, BTreeSet::from([1, 2]));
        assert!(tasks[3].is_join());
        assert_eq!(tasks[3].dependencies, BTreeSet::from([1, 2, 3]));
    }

    /// **Scenario**: prices in a query neither fail as forward references nor bind to a
    /// same-numbered earlier task.
    #[test]
    fn dollar_amounts_in_strings_are_not_references() {
        let tasks = build(
            "1. search(query=\"laptops under $500\")\n2. join()\n",
            1,
            &ExecutionContext::new(),
        )
        .unwrap();
        assert!(tasks[0].dependencies.is_empty());

        let ctx = ctx_with(&[1, 2, 3, 4, 5]);
        let tasks = build("7. search(query=\"coffee for $5\")\n", 7, &ctx).unwrap();
        assert!(tasks[0].dependencies.is_empty());
        assert_eq!(
            tasks[0].arguments.get("query"),
            Some(&ArgValue::Literal(json!("coffee for $5")))
        );
        let resolved = tasks[0].arguments.resolve(|i| ctx.outcome(i)).unwrap();
        assert_eq!(resolved, json!({"query": "coffee for $5"}));

        let braced = build("7. search(query=\"coffee for ${5}\")\n", 7, &ctx).unwrap();
        assert_eq!(braced[0].dependencies, BTreeSet::from([5]));
    }

    #[test]
    fn synthetic_join_is_appended() {
        let tasks = build("1. a(x=1)\n2. b(y=$1)\n", 1, &ExecutionContext::new()).unwrap();
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[2].index, 3);
        assert_eq!(tasks[2].dependencies, BTreeSet::from([1, 2]));
    }

    /// **Scenario**: replan output restarts at 1; tasks move to the continuation point.
    #[test]
    fn drifted_numbering_is_shifted_to_next_index() {
        let ctx = ctx_with(&[1, 2]);
        let tasks = build("1. a(x=1)\n2. b(y=$1)\n3. join()\n", 4, &ctx).unwrap();
        assert_eq!(tasks.iter().map(|t| t.index).collect::<Vec<_>>(), vec![4, 5, 6]);
        assert_eq!(tasks[1].arguments.get("y"), Some(&ArgValue::Reference(4)));
        assert_eq!(tasks[1].dependencies, BTreeSet::from([4]));
    }

    #[test]
    fn correct_numbering_can_reference_earlier_rounds() {
        let ctx = ctx_with(&[1, 2]);
        let tasks = build("4. a(x=$2)\n5. b(y=$4)\n", 4, &ctx).unwrap();
        assert_eq!(tasks[0].dependencies, BTreeSet::from([2]));
        assert_eq!(tasks[1].dependencies, BTreeSet::from([4]));
        assert_eq!(tasks[2].index, 6);
    }

    #[test]
    fn forward_reference_is_rejected() {
        let err = build("1. a(x=$2)\n2. b(y=1)\n", 1, &ExecutionContext::new()).unwrap_err();
        assert!(matches!(
            err,
            BuildError::Dependency(DependencyViolation::ForwardReference { index: 1, reference: 2 })
        ));
        let self_ref = build("1. a(x=$1)\n", 1, &ExecutionContext::new()).unwrap_err();
        assert!(matches!(
            self_ref,
            BuildError::Dependency(DependencyViolation::ForwardReference { .. })
        ));
    }

    #[test]
    fn unknown_reference_is_rejected() {
        let err = build("4. a(x=$2)\n", 4, &ctx_with(&[1])).unwrap_err();
        assert!(matches!(
            err,
            BuildError::Dependency(DependencyViolation::UnknownReference { index: 4, reference: 2 })
        ));
        let gap = build("1. a(x=1)\n3. b(y=$2)\n", 1, &ExecutionContext::new()).unwrap_err();
        assert!(matches!(
            gap,
            BuildError::Dependency(DependencyViolation::UnknownReference { reference: 2, .. })
        ));
    }

    #[test]
    fn repeated_index_is_rejected() {
        let err = build("1. a(x=1)\n1. b(y=2)\n", 1, &ExecutionContext::new()).unwrap_err();
        assert!(matches!(
            err,
            BuildError::Dependency(DependencyViolation::NonIncreasingIndex { .. })
        ));
    }

    #[test]
    fn empty_plan_is_an_error() {
        let err = build("no tasks here\n", 1, &ExecutionContext::new()).unwrap_err();
        assert_eq!(err, BuildError::EmptyPlan);
    }

    #[test]
    fn join_only_plan_is_accepted() {
        let tasks = build("1. join()\n", 7, &ExecutionContext::new()).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].index, 7);
        assert!(tasks[0].dependencies.is_empty());
    }

    #[test]
    fn budget_is_enforced() {
        let (parsed, _) = parse_plan("1. a()\n2. b()\n3. c()\n");
        let mut b = GraphBuilder::new(1, 2);
        let ctx = ExecutionContext::new();
        let mut results = parsed.into_iter().map(|p| b.admit(p, &ctx));
        assert!(results.next().unwrap().is_ok());
        assert!(results.next().unwrap().is_ok());
        assert_eq!(
            results.next().unwrap().unwrap_err(),
            BuildError::BudgetExceeded { limit: 2 }
        );
    }

    #[test]
    fn tasks_after_join_are_ignored() {
        let mut b = GraphBuilder::new(1, 4);
        let ctx = ExecutionContext::new();
        let (parsed, _) = parse_plan("1. a()\n2. join()\n");
        for p in parsed {
            b.admit(p, &ctx).unwrap();
        }
        let (late, _) = parse_plan("3. c()\n");
        assert!(b.admit(late.into_iter().next().unwrap(), &ctx).unwrap().is_none());
        assert!(b.close().unwrap().is_none());
        assert_eq!(b.highest_index(), Some(2));
    }
}
