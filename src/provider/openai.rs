//! OpenAI-style dialect: `/chat/completions` with SSE deltas.
//!
//! Tool calls arrive as incremental deltas indexed by position, not as
//! complete objects — [`ToolCallAggregator`] accumulates them across chunks
//! and only emits [`ContentBlock`]s once a `finish_reason` closes the turn.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::config::Config;
use crate::types::{ContentBlock, Message, MessageRole, TextBlock, ToolUseBlock};
use crate::{Error, Result};

use super::{ProviderClient, ProviderTurn, RawChunkSink, parse_retry_after};

// ============================================================================
// WIRE TYPES
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAIChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<OpenAIChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAIChoice {
    #[serde(default)]
    pub index: u32,
    pub delta: OpenAIDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenAIDelta {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<OpenAIToolCallDelta>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAIToolCallDelta {
    pub index: u32,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<OpenAIFunctionDelta>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenAIFunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

// ============================================================================
// TOOL CALL AGGREGATION
// ============================================================================

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Accumulates streaming deltas into complete content blocks. Buffers are
/// cleared once a `finish_reason` flushes them.
#[derive(Default)]
pub struct ToolCallAggregator {
    text_buffer: String,
    tool_calls: HashMap<u32, PartialToolCall>,
}

impl ToolCallAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_chunk(&mut self, chunk: OpenAIChunk) -> Result<Vec<ContentBlock>> {
        let mut blocks = Vec::new();

        for choice in chunk.choices {
            if let Some(content) = choice.delta.content {
                self.text_buffer.push_str(&content);
            }

            if let Some(tool_calls) = choice.delta.tool_calls {
                for call in tool_calls {
                    let entry = self.tool_calls.entry(call.index).or_default();
                    if let Some(id) = call.id {
                        entry.id = Some(id);
                    }
                    if let Some(function) = call.function {
                        if let Some(name) = function.name {
                            entry.name = Some(name);
                        }
                        if let Some(args) = function.arguments {
                            entry.arguments.push_str(&args);
                        }
                    }
                }
            }

            if choice.finish_reason.is_some() {
                if !self.text_buffer.is_empty() {
                    blocks.push(ContentBlock::Text(TextBlock::new(std::mem::take(&mut self.text_buffer))));
                }

                for (_, partial) in self.tool_calls.drain() {
                    if let (Some(id), Some(name)) = (partial.id, partial.name) {
                        let input: Value = if partial.arguments.is_empty() {
                            serde_json::json!({})
                        } else {
                            serde_json::from_str(&partial.arguments)
                                .map_err(|e| Error::stream(format!("invalid tool arguments JSON: {e}")))?
                        };
                        blocks.push(ContentBlock::ToolUse(ToolUseBlock::new(id, name, input)));
                    }
                }
            }
        }

        Ok(blocks)
    }
}

/// Parse a raw HTTP response body as an SSE stream of [`OpenAIChunk`]s.
pub fn parse_sse_stream(body: reqwest::Response) -> Pin<Box<dyn Stream<Item = Result<OpenAIChunk>> + Send>> {
    let stream = body.bytes_stream().filter_map(move |result| async move {
        let bytes = match result.map_err(Error::Http) {
            Ok(b) => b,
            Err(e) => return Some(Err(e)),
        };

        let text = String::from_utf8_lossy(&bytes);
        for line in text.lines() {
            if let Some(data) = line.strip_prefix("data: ") {
                if data == "[DONE]" {
                    continue;
                }
                return Some(
                    serde_json::from_str::<OpenAIChunk>(data)
                        .map_err(|e| Error::stream(format!("failed to parse chunk: {e}"))),
                );
            }
        }
        None
    });

    Box::pin(stream)
}

// ============================================================================
// MESSAGE CONVERSION
// ============================================================================

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

            let text = m.text();
            let tool_calls: Vec<Value> = m
                .content
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse(t) => Some(serde_json::json!({
                        "id": t.id,
                        "type": "function",
                        "function": { "name": t.name, "arguments": t.input.to_string() },
                    })),
                    _ => None,
                })
                .collect();

            let tool_result = m.content.iter().find_map(|b| match b {
                ContentBlock::ToolResult(r) => Some(r),
                _ => None,
            });

            if let Some(result) = tool_result {
                serde_json::json!({
                    "role": role,
                    "tool_call_id": result.tool_use_id,
                    "content": result.content.to_string(),
                })
            } else if !tool_calls.is_empty() {
                serde_json::json!({ "role": role, "content": text, "tool_calls": tool_calls })
            } else {
                serde_json::json!({ "role": role, "content": text })
            }
        })
        .collect()
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Value>,
    tools: &'a [Value],
    stream: bool,
}

// ============================================================================
// CLIENT
// ============================================================================

pub struct OpenAiClient {
    http: reqwest::Client,
    config: Config,
}

impl OpenAiClient {
    pub fn new(config: Config) -> Self {
        Self { http: reqwest::Client::new(), config }
    }
}

#[async_trait]
impl ProviderClient for OpenAiClient {
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

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let wait = parse_retry_after(response.headers());
            return Err(Error::rate_limit(wait));
        }

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::api(format!("{status}: {text}")));
        }

        let mut stream = parse_sse_stream(response);
        let mut aggregator = ToolCallAggregator::new();
        let mut blocks = Vec::new();

        while let Some(chunk) = stream.next().await {
            if cancelled.load(Ordering::Relaxed) {
                return Err(Error::cancelled());
            }
            let chunk = chunk?;
            for choice in &chunk.choices {
                if let Some(content) = &choice.delta.content {
                    if !content.is_empty() {
                        on_chunk(content);
                    }
                }
            }
            blocks = aggregator.process_chunk(chunk)?;
            if !blocks.is_empty() {
                break;
            }
        }

        Ok(ProviderTurn { blocks, model_used: model.to_string() })
    }
}
