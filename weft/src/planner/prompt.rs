//! Planner prompt text.

pub(crate) const PLANNER_SYSTEM: &str = "\
Given a user request, write a plan that answers it with the utmost parallelism.
Each action in the plan is one call to one of the {num_tools} types below:
{tool_descriptions}
{num_tools}. join(): collects and combines the results of the previous actions. Always the last action of a plan.

Rules:
 - Write one action per line: `<index>. <tool>(<arg>=<value>, ...)`. Values are JSON-like literals.
 - Every action has a unique, strictly increasing index.
 - To use the output of an earlier action, write `$<index>` as the whole value, or
   `${<index>}` inside a string. A bare `$<digits>` inside a string is plain text.
   Only refer to actions with a smaller index.
 - Only use the tools listed above. Do not invent argument names.
 - A line starting with `Thought:` may precede an action to explain it.
 - End the plan with `join()` followed by `<END_OF_PLAN>`.
 - Make the plan as parallel as possible: independent actions must not reference each other.";

pub(crate) const REPLAN_INSTRUCTIONS: &str =
    "The previous plan did not fully answer the request.";

pub(crate) const CONTINUE_NUMBERING: &str = "\
Do NOT repeat actions that already ran; their results are listed above and can be \
referenced by their index. Begin counting at: {next_index}";

pub(crate) const FEEDBACK_HEADER: &str = "Context from last attempt:";
