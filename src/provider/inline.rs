//! Inline tool-call fallback: some dialects (and most local models lacking
//! native function-calling) emit a tool call as a bare JSON object embedded
//! in plain content instead of a structured delta. This scans text for a
//! balanced-brace JSON span matching a known call shape, validates the name
//! against an allowlist, and splits it back out from the surrounding text.

use serde_json::Value;
use uuid::Uuid;

use crate::types::{ContentBlock, TextBlock, ToolUseBlock};

/// One shape a local model might emit: `{"name": ..., "arguments": {...}}`
/// or the looser `{"tool": ..., "args": {...}}`.
fn as_tool_call(obj: &Value, known_tools: &[&str]) -> Option<(String, Value)> {
    let name = obj
        .get("name")
        .or_else(|| obj.get("tool"))
        .and_then(|v| v.as_str())?;

    if !known_tools.contains(&name) {
        return None;
    }

    let args = obj
        .get("arguments")
        .or_else(|| obj.get("args"))
        .cloned()
        .unwrap_or_else(|| serde_json::json!({}));

    Some((name.to_string(), args))
}

/// Find the first balanced `{...}` span in `text` starting at or after
/// `from`, returning its byte range.
fn find_balanced_object(text: &str, from: usize) -> Option<(usize, usize)> {
    let bytes: Vec<(usize, char)> = text.char_indices().collect();
    let start_idx = bytes.iter().position(|(i, _)| *i >= from)?;

    for idx in start_idx..bytes.len() {
        let (start_byte, ch) = bytes[idx];
        if ch != '{' {
            continue;
        }

        let mut depth: i32 = 0;
        for (byte, c) in &bytes[idx..] {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        let end = byte + c.len_utf8();
                        return Some((start_byte, end));
                    }
                }
                _ => {}
            }
        }
    }

    None
}

/// Scan `text` for inline tool-call JSON matching one of `known_tools`,
/// returning the text with matched spans removed and any recognized calls
/// as [`ContentBlock`]s. Text that contains `{...}` but doesn't match a
/// known tool shape is left untouched — it's ordinary content, not a call.
pub fn extract_inline_tool_calls(text: &str, known_tools: &[&str]) -> (String, Vec<ContentBlock>) {
    let mut remaining = text;
    let mut plain = String::new();
    let mut blocks = Vec::new();

    loop {
        match find_balanced_object(remaining, 0) {
            Some((start, end)) => {
                let candidate = &remaining[start..end];
                match serde_json::from_str::<Value>(candidate).ok().and_then(|v| as_tool_call(&v, known_tools)) {
                    Some((name, args)) => {
                        plain.push_str(&remaining[..start]);
                        blocks.push(ContentBlock::ToolUse(ToolUseBlock::new(Uuid::new_v4().to_string(), name, args)));
                        remaining = &remaining[end..];
                    }
                    None => {
                        plain.push_str(&remaining[..end]);
                        remaining = &remaining[end..];
                    }
                }
            }
            None => {
                plain.push_str(remaining);
                break;
            }
        }
    }

    (plain, blocks)
}

/// Build the final content-block list for a turn whose text may embed
/// inline tool calls: plain text first (if non-empty), then any extracted calls.
pub fn normalize_inline_content(text: &str, known_tools: &[&str]) -> Vec<ContentBlock> {
    let (plain, mut blocks) = extract_inline_tool_calls(text, known_tools);
    let trimmed = plain.trim();
    if !trimmed.is_empty() {
        blocks.insert(0, ContentBlock::Text(TextBlock::new(trimmed.to_string())));
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOOLS: &[&str] = &["list_sheets", "write_cell"];

    #[test]
    fn test_extract_plain_text_untouched() {
        let (plain, blocks) = extract_inline_tool_calls("just some text", TOOLS);
        assert_eq!(plain, "just some text");
        assert!(blocks.is_empty());
    }

    #[test]
    fn test_extract_recognized_call() {
        let input = r#"Sure, {"name":"list_sheets","arguments":{}} one moment."#;
        let (plain, blocks) = extract_inline_tool_calls(input, TOOLS);
        assert_eq!(plain, "Sure,  one moment.");
        assert_eq!(blocks.len(), 1);
        assert!(matches!(&blocks[0], ContentBlock::ToolUse(t) if t.name == "list_sheets"));
    }

    #[test]
    fn test_unrecognized_json_left_in_place() {
        let input = r#"here's some data: {"a": 1, "b": 2}"#;
        let (plain, blocks) = extract_inline_tool_calls(input, TOOLS);
        assert_eq!(plain, input);
        assert!(blocks.is_empty());
    }

    #[test]
    fn test_normalize_inline_content_drops_empty_text() {
        let input = r#"{"tool":"write_cell","args":{"cell":"A1","value":1}}"#;
        let blocks = normalize_inline_content(input, TOOLS);
        assert_eq!(blocks.len(), 1);
        assert!(matches!(&blocks[0], ContentBlock::ToolUse(t) if t.name == "write_cell"));
    }
}
