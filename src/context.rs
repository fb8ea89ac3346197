//! Context-budget management: token estimation and history pruning.
//!
//! The agent loop prunes message history before every provider request so the
//! payload stays under the configured character budget. Estimation is
//! character-based (no tokenizer dependency) and intentionally conservative.

use crate::types::{ContentBlock, Message, MessageRole};

/// Estimate token count for a message list.
///
/// Uses a character-based approximation: **1 token ≈ 3 characters**. This is
/// deliberately conservative (overestimates tokens) so the budget check never
/// lets a payload slip past the provider's real context window.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    if messages.is_empty() {
        return 0;
    }

    let mut total_chars = 0;

    for message in messages {
        total_chars += 8; // role formatting overhead

        for block in &message.content {
            match block {
                ContentBlock::Text(text) => {
                    total_chars += text.text.len();
                }
                ContentBlock::ToolUse(tool) => {
                    total_chars += tool.name.len();
                    total_chars += tool.id.len();
                    total_chars += tool.input.to_string().len();
                }
                ContentBlock::ToolResult(result) => {
                    total_chars += result.tool_use_id.len();
                    total_chars += result.content.to_string().len();
                }
            }
        }
    }

    total_chars += 16; // conversation-level overhead

    (total_chars + 2) / 3 // ceiling division, 3 chars per token
}

/// Estimate the character length of a message list (what `max-context-chars`
/// is measured against — see testable property: `estimate_tokens(m) * 3 <=
/// max_context_chars` is equivalent to `char_len(m) <= max_context_chars`).
fn char_len(messages: &[Message]) -> usize {
    estimate_tokens(messages) * 3
}

/// Prune message history to fit a character budget, the way the agent loop
/// does before every provider request.
///
/// Preserves the system message (if it is the first message) and the most
/// recent user message unconditionally; drops the oldest intermediate
/// messages first. If system + last user message alone exceed the budget,
/// only those two (or just the last user message, if there is no leading
/// system message) are sent.
pub fn prune_to_budget(messages: &[Message], max_context_chars: usize) -> Vec<Message> {
    if messages.is_empty() || char_len(messages) <= max_context_chars {
        return messages.to_vec();
    }

    let has_system = messages[0].role == MessageRole::System;
    let last_user_idx = messages.iter().rposition(|m| m.role == MessageRole::User);

    let mut kept: Vec<usize> = (0..messages.len()).collect();

    // Drop oldest intermediate messages (never index 0 if system, never the
    // last user message index) until under budget or nothing left to drop.
    loop {
        let current: Vec<Message> = kept.iter().map(|&i| messages[i].clone()).collect();
        if char_len(&current) <= max_context_chars || kept.len() <= required_floor(has_system) {
            break;
        }

        // Find the oldest droppable index: skip index 0 if it's the system
        // message, skip last_user_idx.
        let drop_pos = kept.iter().position(|&i| {
            let is_system_anchor = has_system && i == 0;
            let is_last_user = last_user_idx == Some(i);
            !is_system_anchor && !is_last_user
        });

        match drop_pos {
            Some(pos) => {
                kept.remove(pos);
            }
            None => break,
        }
    }

    kept.into_iter().map(|i| messages[i].clone()).collect()
}

fn required_floor(has_system: bool) -> usize {
    if has_system { 2 } else { 1 }
}

/// Truncate message history, keeping the most recent `keep` messages.
///
/// Always preserves the system prompt (if present and `preserve_system`) and
/// keeps the most recent N messages. Unlike [`prune_to_budget`], this is a
/// simple count-based truncation with no character-budget awareness.
pub fn truncate_messages(messages: &[Message], keep: usize, preserve_system: bool) -> Vec<Message> {
    if messages.is_empty() {
        return Vec::new();
    }

    if messages.len() <= keep {
        return messages.to_vec();
    }

    let has_system = preserve_system && messages[0].role == MessageRole::System;

    if has_system {
        let mut result = vec![messages[0].clone()];
        if keep > 0 && messages.len() > 1 {
            let start = messages.len().saturating_sub(keep);
            result.extend_from_slice(&messages[start.max(1)..]);
        }
        result
    } else if keep > 0 {
        let start = messages.len().saturating_sub(keep);
        messages[start..].to_vec()
    } else {
        Vec::new()
    }
}

/// Check if history is approaching a token limit.
pub fn is_approaching_limit(messages: &[Message], limit: usize, margin: f32) -> bool {
    let estimated = estimate_tokens(messages);
    let threshold = (limit as f32 * margin) as usize;
    estimated > threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContentBlock, Message, MessageRole, TextBlock};

    #[test]
    fn test_estimate_tokens_empty() {
        let messages: Vec<Message> = vec![];
        assert_eq!(estimate_tokens(&messages), 0);
    }

    #[test]
    fn test_estimate_tokens_simple() {
        let messages = vec![Message::new(
            MessageRole::User,
            vec![ContentBlock::Text(TextBlock::new("Hello world"))],
        )];
        let tokens = estimate_tokens(&messages);
        assert!(tokens >= 5 && tokens <= 14);
    }

    #[test]
    fn test_prune_to_budget_noop_under_budget() {
        let messages = vec![Message::system("sys"), Message::user("hi")];
        let pruned = prune_to_budget(&messages, 10_000);
        assert_eq!(pruned.len(), 2);
    }

    #[test]
    fn test_prune_to_budget_preserves_system_and_last_user() {
        let mut messages = vec![Message::system("system prompt")];
        for i in 0..50 {
            messages.push(Message::user(format!("filler message number {i}")));
        }
        messages.push(Message::user("the actual final question"));

        let pruned = prune_to_budget(&messages, 200);

        assert_eq!(pruned[0].role, MessageRole::System);
        assert_eq!(
            pruned.last().unwrap().content,
            messages.last().unwrap().content
        );
        assert!(pruned.len() < messages.len());
    }

    #[test]
    fn test_prune_to_budget_extreme_keeps_floor_only() {
        let messages = vec![Message::system("s".repeat(500)), Message::user("u".repeat(500))];
        let pruned = prune_to_budget(&messages, 10);
        // Can't go below system + last-user floor even if still over budget.
        assert_eq!(pruned.len(), 2);
    }

    #[test]
    fn test_truncate_messages_preserve_system() {
        let messages = vec![
            Message::system("System prompt"),
            Message::user("Message 1"),
            Message::user("Message 2"),
            Message::user("Message 3"),
            Message::user("Message 4"),
        ];
        let truncated = truncate_messages(&messages, 2, true);
        assert_eq!(truncated.len(), 3);
        assert_eq!(truncated[0].role, MessageRole::System);
    }

    #[test]
    fn test_truncate_messages_no_preserve() {
        let messages = vec![
            Message::system("System prompt"),
            Message::user("Message 1"),
            Message::user("Message 2"),
            Message::user("Message 3"),
        ];
        let truncated = truncate_messages(&messages, 2, false);
        assert_eq!(truncated.len(), 2);
        assert_eq!(truncated[0].role, MessageRole::User);
    }

    #[test]
    fn test_is_approaching_limit() {
        let messages = vec![Message::user("x".repeat(1000))];
        assert!(!is_approaching_limit(&messages, 1000, 0.9));
        assert!(is_approaching_limit(&messages, 200, 0.9));
    }
}
