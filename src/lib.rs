//! # sheet-agent-core
//!
//! Agentic orchestration core for a spreadsheet assistant: a multi-turn,
//! tool-calling conversation loop driven against any OpenAI-, Gemini-, or
//! Ollama-compatible chat endpoint, with human approval gating ahead of
//! mutating spreadsheet operations, an undo journal, conversation
//! persistence, and a bounded-concurrency task orchestrator for read-only
//! queries.
//!
//! ## Key Features
//!
//! - **Multi-dialect provider client**: OpenAI-style SSE, Gemini
//!   `generateContent`, and native Ollama streaming behind one trait.
//! - **Approval-gated mutations**: every `execute_macro` call suspends the
//!   loop until the host confirms or rejects it (unless running in
//!   `ask_before_apply: false` mode).
//! - **Undo journal**: every mutating sub-action is journaled with enough
//!   state to compensate it, batched per conversation turn.
//! - **Context pruning**: conversation history is trimmed to a character
//!   budget before every provider call, preserving the system prompt and the
//!   most recent user message.
//! - **Task orchestrator**: independent read-only tool calls dispatch
//!   concurrently through a bounded worker pool with a short-lived result
//!   cache.
//! - **Conversation persistence**: SQLite-backed storage for conversation
//!   history, per-conversation Excel file paths, and small config overrides.
//!
//! ## Example
//!
//! ```rust,no_run
//! use sheet_agent_core::{AgentLoop, Config, MockSpreadsheetBackend, UndoJournal};
//! use std::sync::Arc;
//! use std::sync::atomic::AtomicBool;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::builder()
//!         .api_key("sk-...")
//!         .model("gpt-4o")
//!         .base_url("https://api.openai.com/v1")
//!         .build()?;
//!
//!     let backend = Arc::new(MockSpreadsheetBackend::new());
//!     let journal = Arc::new(UndoJournal::new_in_memory());
//!     let agent = AgentLoop::new(config, backend, journal);
//!
//!     let mut conversation = sheet_agent_core::Conversation::new("conv-1", 0);
//!     let cancelled = AtomicBool::new(false);
//!     agent.send_message(&mut conversation, "List the sheets.", &cancelled, &|_event| {}).await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **agent**: the turn state machine tying every other module together.
//! - **provider**: dialect-normalized provider client (OpenAI/Gemini/Ollama)
//!   plus the inline tool-call fallback scanner.
//! - **tools**: the static tool registry and the dispatcher that routes
//!   calls to a [`backend::SpreadsheetBackend`].
//! - **backend**: the narrow capability trait the dispatcher drives, with an
//!   in-memory mock for tests.
//! - **approval**: suspends the loop ahead of a mutating call.
//! - **undo**: per-action inverse-operation journal.
//! - **store**: SQLite-backed conversation persistence.
//! - **context**: token estimation and history pruning.
//! - **orchestrator**: bounded-concurrency worker pool for query dispatch.
//! - **relay**: sanitizes streamed text of inline tool-call JSON and
//!   reasoning-channel content before it reaches a UI.
//! - **config**: process-wide configuration and the provider dialect enum.
//! - **error**: the crate's `Error`/`Result` types.
//! - **types**: the canonical message/content-block/conversation model.
//! - **retry**: exponential backoff retry logic with jitter.

mod agent;
mod approval;
mod backend;
mod config;
mod context;
mod error;
mod orchestrator;
mod provider;
mod relay;
mod store;
mod tools;
mod types;
mod undo;

pub mod retry;

// --- Agent Loop ---

pub use agent::{AgentLoop, TurnOutcome, available_models};

// --- Approval Gate ---

pub use approval::{ApprovalGate, PendingAction};

// --- Spreadsheet Backend ---

pub use backend::{CellRef, MacroAction, MockSpreadsheetBackend, RangeRef, SpreadsheetBackend};

// --- Configuration ---

pub use config::{Config, ConfigBuilder, DetailLevel, Dialect};

// --- Context Management ---

pub use context::{estimate_tokens, is_approaching_limit, prune_to_budget, truncate_messages};

// --- Error Handling ---

pub use error::{Error, Result};

// --- Task Orchestrator ---

pub use orchestrator::{HealthStatus, MetricsSnapshot, TaskOrchestrator};

// --- Provider Client ---

pub use provider::{ChunkSink, ProviderClient, ProviderTurn, RawChunkSink, build_client, send_with_fallback};

// --- Stream Relay ---

pub use relay::{RelayEvent, StreamRelay};

// --- Conversation Store ---

pub use store::ConversationStore;

// --- Tool Registry & Dispatcher ---

pub use tools::{Dispatcher, Param, ToolDeclaration, ToolRegistry, is_query_tool};

// --- Core Types ---

pub use types::{
    BaseUrl, ContentBlock, Conversation, ConversationSummary, Message, MessageRole, ModelInfo,
    ModelName, TextBlock, ToolCall, ToolResultBlock, ToolUseBlock,
};

// --- Undo Journal ---

pub use undo::{UndoAction, UndoJournal, new_batch_id};

// ============================================================================
// CONVENIENCE PRELUDE
// ============================================================================

/// Import with `use sheet_agent_core::prelude::*;` for the common set of
/// types needed to drive an [`AgentLoop`] end to end.
pub mod prelude {
    pub use crate::{
        AgentLoop, ApprovalGate, Config, ContentBlock, Conversation, Dispatcher, Error, Message,
        MessageRole, MockSpreadsheetBackend, PendingAction, Result, SpreadsheetBackend,
        TaskOrchestrator, ToolCall, TurnOutcome, UndoJournal,
    };
}
