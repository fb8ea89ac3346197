//! Provider Client: dialect-agnostic turn execution.
//!
//! Each dialect module normalizes its wire format down to the canonical
//! [`crate::types::ContentBlock`] sequence before returning — nothing
//! dialect-specific leaks past this module (see the normalization-boundary
//! design note on [`crate::types`]).

pub mod gemini;
pub mod inline;
pub mod ollama;
pub mod openai;

use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::sleep;
use tracing::warn;

use crate::Result;
use crate::config::{Config, Dialect};
use crate::relay::{RelayEvent, StreamRelay};
use crate::retry::{RetryConfig, is_retryable_error};
use crate::types::{ContentBlock, Message};

/// One complete provider turn.
#[derive(Debug, Clone)]
pub struct ProviderTurn {
    pub blocks: Vec<ContentBlock>,
    /// The model that actually served this turn (differs from
    /// `config.model` when the fallback model was used).
    pub model_used: String,
}

/// Raw text delta sink a [`ProviderClient`] feeds as chunks arrive on the
/// wire, before any sanitization — see [`ChunkSink`] for the sanitized,
/// caller-facing counterpart produced by [`send_with_fallback`].
pub type RawChunkSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Sanitized relay output sink handed to [`send_with_fallback`] callers.
pub type ChunkSink<'a> = &'a (dyn Fn(RelayEvent) + Send + Sync);

/// Narrow capability the agent loop drives: send one turn's worth of
/// history plus the tool catalog, get back normalized content blocks.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn send_turn(
        &self,
        messages: &[Message],
        tools: &[Value],
        model: &str,
        cancelled: &AtomicBool,
        on_chunk: RawChunkSink<'_>,
    ) -> Result<ProviderTurn>;
}

/// Construct the concrete client for the configured dialect.
pub fn build_client(config: &Config) -> Arc<dyn ProviderClient> {
    match config.provider {
        Dialect::OpenAI => Arc::new(openai::OpenAiClient::new(config.clone())),
        Dialect::Gemini => Arc::new(gemini::GeminiClient::new(config.clone())),
        Dialect::Ollama => Arc::new(ollama::OllamaClient::new(config.clone())),
    }
}

/// Read `Retry-After` off a response's headers: a plain integer is seconds,
/// otherwise it's tried as an RFC1123 HTTP-date; absent or unparseable
/// falls back to a fixed default wait.
pub fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Duration {
    const DEFAULT_WAIT: Duration = Duration::from_secs(2);

    let Some(value) = headers.get(reqwest::header::RETRY_AFTER).and_then(|v| v.to_str().ok()) else {
        return DEFAULT_WAIT;
    };
    let value = value.trim();

    if let Ok(secs) = value.parse::<u64>() {
        return Duration::from_secs(secs);
    }

    if let Ok(when) = httpdate::parse_http_date(value) {
        if let Ok(wait) = when.duration_since(std::time::SystemTime::now()) {
            return wait;
        }
    }

    DEFAULT_WAIT
}

/// Number of attempts made against the primary model before falling back
/// (see the e2e rate-limit scenario: two 429s on the primary, then one
/// successful call against the fallback model).
const MAX_PRIMARY_ATTEMPTS: u32 = 2;

/// Send against the primary model, retrying rate limits and other
/// transient failures in place; if the primary model is still failing
/// after `MAX_PRIMARY_ATTEMPTS` and a `tool_model` is configured, make one
/// more attempt against it with no further delay. Streamed text is routed
/// through a [`StreamRelay`] and forwarded to `on_event` as sanitized
/// [`RelayEvent`]s, including a [`RelayEvent::Notice`] each time a rate
/// limit is hit.
pub async fn send_with_fallback(
    client: &dyn ProviderClient,
    config: &Config,
    messages: &[Message],
    tools: &[Value],
    cancelled: &AtomicBool,
    on_event: ChunkSink<'_>,
) -> Result<ProviderTurn> {
    let relay = Mutex::new(StreamRelay::new());
    let raw_sink = |delta: &str| {
        for event in relay.lock().unwrap().feed(delta) {
            on_event(event);
        }
    };
    let retry_config = RetryConfig::new();

    let mut last_err = None;

    for attempt in 0..MAX_PRIMARY_ATTEMPTS {
        match client.send_turn(messages, tools, &config.model, cancelled, &raw_sink).await {
            Ok(turn) => {
                for event in relay.lock().unwrap().finish() {
                    on_event(event);
                }
                return Ok(turn);
            }
            Err(e @ crate::Error::Cancelled) => return Err(e),
            Err(e) => {
                if !is_retryable_error(&e) {
                    return Err(e);
                }

                let wait = match &e {
                    crate::Error::RateLimit(wait) => {
                        on_event(RelayEvent::Notice(format!(
                            "Rate limited by {}, retrying in {}s…",
                            config.model,
                            wait.as_secs()
                        )));
                        *wait
                    }
                    _ => retry_config.delay_for_attempt(attempt),
                };

                warn!(error = %e, attempt, model = %config.model, "primary model call failed, retrying");
                last_err = Some(e);
                sleep(wait).await;
            }
        }
    }

    if let Some(fallback_model) = &config.tool_model {
        warn!(fallback_model, "primary model exhausted retries, falling back");
        let turn = client.send_turn(messages, tools, fallback_model, cancelled, &raw_sink).await?;
        for event in relay.lock().unwrap().finish() {
            on_event(event);
        }
        return Ok(turn);
    }

    Err(last_err.unwrap_or_else(|| crate::Error::other("provider exhausted retries")))
}
