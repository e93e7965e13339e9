//! Pulls a JSON document out of model output.

use serde_json::Value;

fn fenced_blocks(text: &str) -> impl Iterator<Item = &str> {
    text.split("```").skip(1).step_by(2).map(|block| {
        let block = block.trim_start();
        let block = block
            .strip_prefix("json")
            .or_else(|| block.strip_prefix("JSON"))
            .unwrap_or(block);
        block.trim()
    })
}

fn outermost(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let close = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

/// Finds the first JSON value in `text`: a fenced block (```` ```json ````) first, then the
/// whole text, then the outermost `{..}` / `[..]` span.
pub fn extract_json(text: &str) -> Option<Value> {
    fenced_blocks(text)
        .chain(std::iter::once(text.trim()))
        .chain(outermost(text))
        .find_map(|candidate| serde_json::from_str::<Value>(candidate).ok())
        .filter(|v| v.is_object() || v.is_array())
}
