//! Native Ollama dialect: `/api/chat`, newline-delimited JSON streaming.
//!
//! Ollama's streaming responses are one JSON object per line (no `data: `
//! prefix, no `[DONE]` sentinel — the final line carries `"done": true`) and
//! tool-call arguments arrive as a complete JSON object rather than a string
//! to be re-parsed, unlike the OpenAI dialect.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::Config;
use crate::types::{ContentBlock, Message, MessageRole, TextBlock, ToolUseBlock};
use crate::{Error, Result};

use super::{ProviderClient, ProviderTurn, RawChunkSink, parse_retry_after};

#[derive(Debug, Clone, Deserialize)]
struct OllamaChunk {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<OllamaToolCall>,
}

#[derive(Debug, Clone, Deserialize)]
struct OllamaToolCall {
    function: OllamaFunctionCall,
}

#[derive(Debug, Clone, Deserialize)]
struct OllamaFunctionCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

fn to_wire_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                MessageRole::System => "system",
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
                MessageRole::Tool => "tool",
            };

            if let Some(result) = m.content.iter().find_map(|b| match b {
                ContentBlock::ToolResult(r) => Some(r),
                _ => None,
            }) {
                return serde_json::json!({ "role": "tool", "content": result.content.to_string() });
            }

            let tool_calls: Vec<Value> = m
                .content
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse(t) => Some(serde_json::json!({
                        "function": { "name": t.name, "arguments": t.input },
                    })),
                    _ => None,
                })
                .collect();

            if tool_calls.is_empty() {
                serde_json::json!({ "role": role, "content": m.text() })
            } else {
                serde_json::json!({ "role": role, "content": m.text(), "tool_calls": tool_calls })
            }
        })
        .collect()
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Value>,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    tools: &'a [Value],
    stream: bool,
}

pub struct OllamaClient {
    http: reqwest::Client,
    config: Config,
}

impl OllamaClient {
    pub fn new(config: Config) -> Self {
        Self { http: reqwest::Client::new(), config }
    }
}

#[async_trait]
impl ProviderClient for OllamaClient {
    async fn send_turn(
        &self,
        messages: &[Message],
        tools: &[Value],
        model: &str,
        cancelled: &AtomicBool,
        on_chunk: RawChunkSink<'_>,
    ) -> Result<ProviderTurn> {
        let url = format!("{}{}", self.config.base_url, self.config.provider.default_chat_path());
        let body = ChatRequest { model, messages: to_wire_messages(messages), tools, stream: true };

        let response = self.http.post(&url).json(&body).send().await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let wait = parse_retry_after(response.headers());
            return Err(Error::rate_limit(wait));
        }

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::api(format!("{status}: {text}")));
        }

        let mut byte_stream = response.bytes_stream();
        let mut text_buffer = String::new();
        let mut blocks = Vec::new();
        let mut leftover = String::new();

        'outer: while let Some(chunk) = byte_stream.next().await {
            if cancelled.load(Ordering::Relaxed) {
                return Err(Error::cancelled());
            }

            let bytes = chunk?;
            leftover.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(newline) = leftover.find('\n') {
                let line: String = leftover.drain(..=newline).collect();
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let parsed: OllamaChunk = serde_json::from_str(line)
                    .map_err(|e| Error::stream(format!("failed to parse ollama chunk: {e}")))?;

                if let Some(message) = parsed.message {
                    if !message.content.is_empty() {
                        on_chunk(&message.content);
                    }
                    text_buffer.push_str(&message.content);
                    for call in message.tool_calls {
                        blocks.push(ContentBlock::ToolUse(ToolUseBlock::new(
                            Uuid::new_v4().to_string(),
                            call.function.name,
                            call.function.arguments,
                        )));
                    }
                }

                if parsed.done {
                    if !text_buffer.is_empty() {
                        blocks.insert(0, ContentBlock::Text(TextBlock::new(std::mem::take(&mut text_buffer))));
                    }
                    break 'outer;
                }
            }
        }

        Ok(ProviderTurn { blocks, model_used: model.to_string() })
    }
}
