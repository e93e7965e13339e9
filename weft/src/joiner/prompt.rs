//! Joiner prompt text.

pub(crate) const JOINER_SYSTEM: &str = "\
You decide whether the results of the executed actions answer the user's request.
First think step by step about what the results show. Then choose one action:
 - answer, if the results are sufficient (failed actions may still leave enough information);
 - replan, if important information is missing or an action failed in a way another attempt could fix.
Reply with a single JSON object and nothing else:
{\"thought\": \"<your reasoning>\", \"action\": {\"response\": \"<final answer to the user>\"}}
or
{\"thought\": \"<your reasoning>\", \"action\": {\"feedback\": \"<what was tried and what is still missing>\"}}";

pub(crate) const FORMAT_REMINDER: &str = "\
Your previous reply could not be used: {error}. Reply again with exactly one JSON object \
in the format described above.";
