//! Core data model: messages, content blocks, conversations, and model info.
//!
//! Wire-format types for individual provider dialects live under
//! [`crate::provider`]; everything here is the canonical, dialect-agnostic
//! shape the rest of the crate operates on (see the normalization-boundary
//! design note).

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// VALIDATED NEWTYPES
// ============================================================================

/// A validated, non-empty model name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelName(String);

impl ModelName {
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(crate::Error::invalid_input("model name must not be empty"));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ModelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A validated base URL (must parse as `http(s)://...`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseUrl(String);

impl BaseUrl {
    pub fn new(url: impl Into<String>) -> crate::Result<Self> {
        let url = url.into();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(crate::Error::invalid_input(format!(
                "base URL must start with http:// or https://, got: {url}"
            )));
        }
        Ok(Self(url.trim_end_matches('/').to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BaseUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// MESSAGE / CONTENT BLOCKS
// ============================================================================

/// Role of a message within a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        };
        write!(f, "{s}")
    }
}

/// A unit of message content. Assistant messages may carry zero or more
/// [`ContentBlock::ToolUse`] entries; tool-response messages carry exactly
/// one [`ContentBlock::ToolResult`] whose `tool_use_id` links back to the
/// originating [`ToolUseBlock`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text(TextBlock),
    ToolUse(ToolUseBlock),
    ToolResult(ToolResultBlock),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    pub text: String,
}

impl TextBlock {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// A canonical tool invocation emitted by the model, normalized from
/// whichever wire dialect produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseBlock {
    pub id: String,
    pub name: String,
    pub input: Value,
}

impl ToolUseBlock {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
        }
    }
}

/// The canonical tool-call alias used by the provider/dispatcher boundary.
pub type ToolCall = ToolUseBlock;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultBlock {
    pub tool_use_id: String,
    pub content: Value,
}

impl ToolResultBlock {
    pub fn new(tool_use_id: impl Into<String>, content: Value) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content,
        }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn new(role: MessageRole, content: Vec<ContentBlock>) -> Self {
        Self { role, content }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(MessageRole::System, vec![ContentBlock::Text(TextBlock::new(text))])
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(MessageRole::User, vec![ContentBlock::Text(TextBlock::new(text))])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, vec![ContentBlock::Text(TextBlock::new(text))])
    }

    /// Build an assistant message carrying tool calls (and optional lead-in text).
    pub fn assistant_with_tool_calls(text: Option<String>, calls: Vec<ToolUseBlock>) -> Self {
        let mut content = Vec::new();
        if let Some(text) = text {
            if !text.is_empty() {
                content.push(ContentBlock::Text(TextBlock::new(text)));
            }
        }
        content.extend(calls.into_iter().map(ContentBlock::ToolUse));
        Self::new(MessageRole::Assistant, content)
    }

    /// Build a tool-response message for the given originating call id.
    pub fn tool_result(tool_use_id: impl Into<String>, content: Value) -> Self {
        Self::new(
            MessageRole::Tool,
            vec![ContentBlock::ToolResult(ToolResultBlock::new(tool_use_id, content))],
        )
    }

    /// Tool-use ids carried by this message, if it is an assistant message.
    pub fn tool_call_ids(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse(t) => Some(t.id.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Concatenated text content, ignoring tool blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text(t) => Some(t.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

// ============================================================================
// CONVERSATION
// ============================================================================

/// A persisted conversation: ordered messages plus metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
    pub context: String,
    pub excel_file_path: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Conversation {
    pub fn new(id: impl Into<String>, created_at: i64) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            messages: Vec::new(),
            context: String::new(),
            excel_file_path: None,
            created_at,
            updated_at: created_at,
        }
    }

    /// A short preview derived from the first user message, for list summaries.
    pub fn preview(&self) -> String {
        self.messages
            .iter()
            .find(|m| m.role == MessageRole::User)
            .map(|m| {
                let text = m.text();
                if text.len() > 80 {
                    let cut = text.char_indices().map(|(i, _)| i).take_while(|&i| i <= 80).last().unwrap_or(0);
                    format!("{}…", &text[..cut])
                } else {
                    text
                }
            })
            .unwrap_or_default()
    }
}

/// Summary row returned by `ListConversations`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub preview: String,
    pub updated_at: i64,
}

impl From<&Conversation> for ConversationSummary {
    fn from(c: &Conversation) -> Self {
        Self {
            id: c.id.clone(),
            title: c.title.clone(),
            preview: c.preview(),
            updated_at: c.updated_at,
        }
    }
}

// ============================================================================
// MODEL INFO
// ============================================================================

/// A model advertised by `GetAvailableModels`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub context_length: Option<u32>,
    pub description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_name_rejects_empty() {
        assert!(ModelName::new("").is_err());
        assert!(ModelName::new("gpt-4o").is_ok());
    }

    #[test]
    fn test_base_url_requires_scheme() {
        assert!(BaseUrl::new("localhost:1234").is_err());
        let url = BaseUrl::new("http://localhost:1234/v1/").unwrap();
        assert_eq!(url.as_str(), "http://localhost:1234/v1");
    }

    #[test]
    fn test_message_tool_call_ids() {
        let msg = Message::assistant_with_tool_calls(
            Some("checking".to_string()),
            vec![ToolUseBlock::new("call_1", "list_sheets", serde_json::json!({}))],
        );
        assert_eq!(msg.tool_call_ids(), vec!["call_1"]);
        assert_eq!(msg.text(), "checking");
    }

    #[test]
    fn test_conversation_preview() {
        let mut conv = Conversation::new("c1", 0);
        conv.messages.push(Message::user("Put 42 in A1"));
        assert_eq!(conv.preview(), "Put 42 in A1");
    }

    #[test]
    fn test_conversation_preview_truncates_on_char_boundary() {
        // A 3-byte '€' straddles byte offset 80 (78 plain bytes + '€' spans 78..81).
        let mut conv = Conversation::new("c1", 0);
        let text = format!("{}€{}", "a".repeat(78), "b".repeat(20));
        conv.messages.push(Message::user(text));
        let preview = conv.preview();
        assert!(preview.ends_with('…'));
        assert!(preview.is_char_boundary(preview.len() - '…'.len_utf8()));
    }
}
