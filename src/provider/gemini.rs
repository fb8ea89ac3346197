//! Gemini-style dialect: `generateContent` / `streamGenerateContent`.
//!
//! Gemini's streaming format is a top-level JSON array of partial
//! `GenerateContentResponse` objects rather than classic SSE deltas; this
//! client reads the full response body and folds it down to one
//! [`ProviderTurn`], which keeps it a drop-in alongside the SSE-based
//! dialects behind [`super::ProviderClient`].

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::config::Config;
use crate::types::{ContentBlock, Message, MessageRole, TextBlock, ToolUseBlock};
use crate::{Error, Result};

use super::{ProviderClient, ProviderTurn, RawChunkSink, parse_retry_after};

fn to_gemini_contents(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system_parts = Vec::new();
    let mut contents = Vec::new();

    for message in messages {
        match message.role {
            MessageRole::System => {
                let text = message.text();
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            MessageRole::User => {
                contents.push(serde_json::json!({
                    "role": "user",
                    "parts": [{ "text": message.text() }],
                }));
            }
            MessageRole::Assistant => {
                let mut parts = Vec::new();
                let text = message.text();
                if !text.is_empty() {
                    parts.push(serde_json::json!({ "text": text }));
                }
                for block in &message.content {
                    if let ContentBlock::ToolUse(tool) = block {
                        parts.push(serde_json::json!({
                            "functionCall": { "name": tool.name, "args": tool.input },
                        }));
                    }
                }
                contents.push(serde_json::json!({ "role": "model", "parts": parts }));
            }
            MessageRole::Tool => {
                for block in &message.content {
                    if let ContentBlock::ToolResult(result) = block {
                        contents.push(serde_json::json!({
                            "role": "function",
                            "parts": [{
                                "functionResponse": {
                                    "name": result.tool_use_id,
                                    "response": { "content": result.content },
                                },
                            }],
                        }));
                    }
                }
            }
        }
    }

    let system_instruction = if system_parts.is_empty() { None } else { Some(system_parts.join("\n\n")) };
    (system_instruction, contents)
}

fn parse_candidate_parts(body: &Value) -> Vec<ContentBlock> {
    let mut blocks = Vec::new();
    let mut text = String::new();

    let parts = body
        .pointer("/candidates/0/content/parts")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    for part in parts {
        if let Some(t) = part.get("text").and_then(|v| v.as_str()) {
            text.push_str(t);
        }
        if let Some(call) = part.get("functionCall") {
            let name = call.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let args = call.get("args").cloned().unwrap_or_else(|| serde_json::json!({}));
            blocks.push(ContentBlock::ToolUse(ToolUseBlock::new(Uuid::new_v4().to_string(), name, args)));
        }
    }

    if !text.is_empty() {
        blocks.insert(0, ContentBlock::Text(TextBlock::new(text)));
    }

    blocks
}

pub struct GeminiClient {
    http: reqwest::Client,
    config: Config,
}

impl GeminiClient {
    pub fn new(config: Config) -> Self {
        Self { http: reqwest::Client::new(), config }
    }
}

#[async_trait]
impl ProviderClient for GeminiClient {
    async fn send_turn(
        &self,
        messages: &[Message],
        tools: &[Value],
        model: &str,
        cancelled: &AtomicBool,
        on_chunk: RawChunkSink<'_>,
    ) -> Result<ProviderTurn> {
        if cancelled.load(Ordering::Relaxed) {
            return Err(Error::cancelled());
        }

        let (system_instruction, contents) = to_gemini_contents(messages);

        let mut body = serde_json::json!({ "contents": contents });
        if let Some(system) = system_instruction {
            body["systemInstruction"] = serde_json::json!({ "parts": [{ "text": system }] });
        }
        if !tools.is_empty() {
            body["tools"] = serde_json::json!([{ "functionDeclarations": tools }]);
        }

        let url = format!(
            "{}/models/{}{}?key={}",
            self.config.base_url,
            model,
            self.config.provider.default_chat_path(),
            self.config.api_key
        );

        let response = self.http.post(&url).json(&body).send().await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let wait = parse_retry_after(response.headers());
            return Err(Error::rate_limit(wait));
        }

        if !response.status().is_success() {
            let status = response.status();
            let headers = response.headers().clone();
            let text = response.text().await.unwrap_or_default();
            if text.contains("RESOURCE_EXHAUSTED") {
                return Err(Error::rate_limit(parse_retry_after(&headers)));
            }
            return Err(Error::api(format!("{status}: {text}")));
        }

        if cancelled.load(Ordering::Relaxed) {
            return Err(Error::cancelled());
        }

        let parsed: Value = response.json().await?;
        let blocks = parse_candidate_parts(&parsed);

        for block in &blocks {
            if let ContentBlock::Text(text) = block {
                if !text.text.is_empty() {
                    on_chunk(&text.text);
                }
            }
        }

        Ok(ProviderTurn { blocks, model_used: model.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_gemini_contents_separates_system() {
        let messages = vec![Message::system("be terse"), Message::user("hi")];
        let (system, contents) = to_gemini_contents(&messages);
        assert_eq!(system, Some("be terse".to_string()));
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0]["role"], "user");
    }

    #[test]
    fn test_parse_candidate_parts_text_and_call() {
        let body = serde_json::json!({
            "candidates": [{
                "content": {
                    "parts": [
                        { "text": "checking sheets" },
                        { "functionCall": { "name": "list_sheets", "args": {} } },
                    ]
                }
            }]
        });
        let blocks = parse_candidate_parts(&body);
        assert_eq!(blocks.len(), 2);
        assert!(matches!(&blocks[0], ContentBlock::Text(t) if t.text == "checking sheets"));
        assert!(matches!(&blocks[1], ContentBlock::ToolUse(t) if t.name == "list_sheets"));
    }
}
