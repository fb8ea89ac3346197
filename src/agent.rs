//! Agent Loop: the multi-turn state machine tying the rest of the crate
//! together.
//!
//! `IDLE → SENDING → STREAMING → DISPATCHING → {AWAITING_APPROVAL | SENDING}
//! → … → DONE`, with `CANCELLED`, `FAILED`, and `STEP_CAP_HIT` as the other
//! terminal states. One [`AgentLoop`] is built per process and driven across
//! many conversations; the mutable state per turn lives on the caller's
//! [`Conversation`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tracing::{info, warn};

use crate::approval::{ApprovalGate, PendingAction};
use crate::backend::SpreadsheetBackend;
use crate::config::Config;
use crate::context::prune_to_budget;
use crate::orchestrator::TaskOrchestrator;
use crate::provider::{self, ChunkSink, ProviderClient, inline};
use crate::tools::{Dispatcher, ToolRegistry, is_query_tool};
use crate::types::{Conversation, ContentBlock, Message, MessageRole, ToolCall};
use crate::undo::{UndoJournal, new_batch_id};
use crate::{Error, Result};

/// A fixed maximum number of turn iterations per `SendMessage` call (design
/// target: 10-15).
const DEFAULT_STEP_CAP: u32 = 12;

fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}

/// Result of driving the loop to its next suspension or terminal point.
#[derive(Debug, Clone)]
pub enum TurnOutcome {
    /// The model produced no further tool calls; the turn is complete.
    Done { text: String, model_used: String },
    /// A mutating call is waiting on `ConfirmPendingAction` / `RejectPendingAction`.
    AwaitingApproval(PendingAction),
    /// `CancelChat` interrupted the turn before it completed.
    Cancelled,
    /// The step cap fired; the conversation carries an `agent-paused` sentinel.
    StepCapHit,
}

/// Dispatch a query call through the Task Orchestrator's cache, keyed on the
/// call's name and arguments, formatting the outcome as a tool-response
/// message. Only reachable when every call in a turn is a query call (see
/// CONCURRENCY & RESOURCE MODEL — parallel dispatch is never mixed with a
/// mutating call in the same turn).
async fn dispatch_query_cached(dispatcher: Arc<Dispatcher>, orchestrator: Arc<TaskOrchestrator>, call: ToolCall) -> Message {
    let cache_key = format!("{}:{}", call.name, call.input);
    let id = call.id.clone();
    let result = orchestrator.run_query(&cache_key, async move { dispatcher.run_query(&call).await }).await;
    let content = match result {
        Ok(v) => v,
        Err(e) => serde_json::json!({ "error": e.to_string() }),
    };
    Message::tool_result(id, content)
}

/// Drives one user request through the turn algorithm: prune, send, stream,
/// dispatch (or suspend), repeat until the model stops calling tools or the
/// step cap fires.
pub struct AgentLoop {
    config: Config,
    provider: Arc<dyn ProviderClient>,
    registry: ToolRegistry,
    dispatcher: Arc<Dispatcher>,
    approval: Arc<ApprovalGate>,
    journal: Arc<UndoJournal>,
    orchestrator: Arc<TaskOrchestrator>,
    step_cap: u32,
}

impl AgentLoop {
    pub fn new(config: Config, backend: Arc<dyn SpreadsheetBackend>, journal: Arc<UndoJournal>) -> Self {
        let provider = provider::build_client(&config);
        Self::with_provider(config, backend, journal, provider)
    }

    /// Construct with an explicit [`ProviderClient`] — the seam tests drive
    /// to avoid real HTTP.
    pub fn with_provider(
        config: Config,
        backend: Arc<dyn SpreadsheetBackend>,
        journal: Arc<UndoJournal>,
        provider: Arc<dyn ProviderClient>,
    ) -> Self {
        Self {
            config,
            provider,
            registry: ToolRegistry::new(),
            dispatcher: Arc::new(Dispatcher::new(backend)),
            approval: Arc::new(ApprovalGate::new()),
            journal,
            orchestrator: Arc::new(TaskOrchestrator::new(5, 60)),
            step_cap: DEFAULT_STEP_CAP,
        }
    }

    pub fn has_pending_action(&self, conversation_id: &str) -> bool {
        self.approval.has_pending_action(conversation_id)
    }

    pub fn peek_pending_action(&self, conversation_id: &str) -> Option<PendingAction> {
        self.approval.peek(conversation_id)
    }

    pub fn undo_journal(&self) -> &UndoJournal {
        &self.journal
    }

    pub fn orchestrator(&self) -> &TaskOrchestrator {
        &self.orchestrator
    }

    /// `SendMessage`: append the user's text and run turns until completion,
    /// suspension, cancellation, or the step cap. `on_event` receives
    /// sanitized streaming output (see [`crate::relay::StreamRelay`]) as the
    /// model responds.
    pub async fn send_message(
        &self,
        conversation: &mut Conversation,
        text: &str,
        cancelled: &AtomicBool,
        on_event: ChunkSink<'_>,
    ) -> Result<TurnOutcome> {
        if self.approval.has_pending_action(&conversation.id) {
            return Err(Error::pending_action(format!(
                "conversation {} has a pending action awaiting confirm/reject",
                conversation.id
            )));
        }

        conversation.messages.push(Message::user(text));
        conversation.updated_at = now_ts();
        self.run_turns(conversation, cancelled, on_event).await
    }

    /// `ConfirmPendingAction`: dispatch the suspended call for real, then resume.
    pub async fn confirm_pending_action(
        &self,
        conversation: &mut Conversation,
        cancelled: &AtomicBool,
        on_event: ChunkSink<'_>,
    ) -> Result<TurnOutcome> {
        let pending = self.approval.confirm(&conversation.id)?;
        let call = ToolCall::new(
            pending.tool_call_id.clone(),
            "execute_macro",
            serde_json::json!({ "actions": pending.actions }),
        );
        let msg = self
            .dispatcher
            .dispatch_macro(&call, &conversation.id, pending.batch_id, &self.journal)
            .await?;
        conversation.messages.push(msg);
        conversation.updated_at = now_ts();
        self.run_turns(conversation, cancelled, on_event).await
    }

    /// `RejectPendingAction`: drop the suspended call, tell the model it was
    /// declined, and resume.
    pub async fn reject_pending_action(
        &self,
        conversation: &mut Conversation,
        cancelled: &AtomicBool,
        on_event: ChunkSink<'_>,
    ) -> Result<TurnOutcome> {
        let pending = self.approval.reject(&conversation.id)?;
        conversation
            .messages
            .push(Message::tool_result(pending.tool_call_id.clone(), serde_json::json!({ "status": "user declined this action" })));
        conversation.updated_at = now_ts();
        self.run_turns(conversation, cancelled, on_event).await
    }

    async fn run_turns(&self, conversation: &mut Conversation, cancelled: &AtomicBool, on_event: ChunkSink<'_>) -> Result<TurnOutcome> {
        let known_tools = self.registry.names();
        let tools = self.registry.for_dialect(self.config.provider);

        for _ in 0..self.step_cap {
            if cancelled.load(Ordering::Relaxed) {
                return Ok(TurnOutcome::Cancelled);
            }

            let pruned = prune_to_budget(&conversation.messages, self.config.max_context_chars);
            let batch_id = new_batch_id();

            let turn = match provider::send_with_fallback(self.provider.as_ref(), &self.config, &pruned, &tools, cancelled, on_event).await {
                Ok(turn) => turn,
                Err(Error::Cancelled) => return Ok(TurnOutcome::Cancelled),
                Err(e) => return Err(e),
            };

            let mut blocks = Vec::new();
            for block in turn.blocks {
                match block {
                    ContentBlock::Text(text) => blocks.extend(inline::normalize_inline_content(&text.text, &known_tools)),
                    other => blocks.push(other),
                }
            }

            conversation.messages.push(Message::new(MessageRole::Assistant, blocks.clone()));
            conversation.updated_at = now_ts();

            let tool_calls: Vec<ToolCall> = blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse(t) => Some(t.clone()),
                    _ => None,
                })
                .collect();

            if tool_calls.is_empty() {
                let text = blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text(t) => Some(t.text.as_str()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("");
                return Ok(TurnOutcome::Done { text, model_used: turn.model_used });
            }

            // A batch dispatches fully in parallel only when every call is a
            // query; any mutating call present forces full sequential order.
            let all_query = tool_calls.iter().all(|c| is_query_tool(&c.name));

            if all_query {
                let futures = tool_calls
                    .iter()
                    .cloned()
                    .map(|call| dispatch_query_cached(self.dispatcher.clone(), self.orchestrator.clone(), call));
                let results = futures::future::join_all(futures).await;
                conversation.messages.extend(results);
            } else {
                for call in &tool_calls {
                    if is_query_tool(&call.name) {
                        let msg = self.dispatcher.dispatch_query(call).await;
                        conversation.messages.push(msg);
                        continue;
                    }

                    if self.config.ask_before_apply {
                        let pending = self.approval.suspend(&conversation.id, batch_id, call, now_ts())?;
                        conversation.updated_at = now_ts();
                        info!(conversation_id = %conversation.id, batch_id, "suspended turn awaiting approval");
                        return Ok(TurnOutcome::AwaitingApproval(pending));
                    }

                    let msg = self.dispatcher.dispatch_macro(call, &conversation.id, batch_id, &self.journal).await?;
                    conversation.messages.push(msg);
                }
            }

            conversation.updated_at = now_ts();
        }

        warn!(conversation_id = %conversation.id, step_cap = self.step_cap, "step cap reached");
        conversation.messages.push(Message::assistant(
            "Reached the step limit for this request — say \"continue\" to keep going.",
        ));
        Ok(TurnOutcome::StepCapHit)
    }
}

/// `GetAvailableModels`: delegated to the configured dialect's catalog
/// endpoint, kept here (rather than in `provider`) since it is a
/// process-level config query rather than a per-turn operation.
pub async fn available_models(config: &Config) -> Result<Vec<Value>> {
    let url = format!("{}/models", config.base_url);
    let client = reqwest::Client::new();
    let response = client.get(&url).bearer_auth(&config.api_key).send().await?;

    if !response.status().is_success() {
        let status = response.status();
        return Err(Error::api(format!("failed to list models: {status}")));
    }

    let body: Value = response.json().await?;
    Ok(body
        .get("data")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockSpreadsheetBackend;
    use crate::provider::ProviderTurn;
    use crate::types::{TextBlock, ToolUseBlock};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct StubProvider {
        turns: Mutex<VecDeque<Result<ProviderTurn>>>,
    }

    impl StubProvider {
        fn new(turns: Vec<ProviderTurn>) -> Arc<Self> {
            Arc::new(Self { turns: Mutex::new(turns.into_iter().map(Ok).collect()) })
        }
    }

    #[async_trait]
    impl ProviderClient for StubProvider {
        async fn send_turn(
            &self,
            _messages: &[Message],
            _tools: &[Value],
            _model: &str,
            _cancelled: &AtomicBool,
            _on_chunk: crate::provider::RawChunkSink<'_>,
        ) -> Result<ProviderTurn> {
            self.turns
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(Error::other("stub provider exhausted")))
        }
    }

    fn noop_chunk_sink(_: crate::relay::RelayEvent) {}

    fn no_sink() -> ChunkSink<'static> {
        &noop_chunk_sink
    }

    fn test_config(ask_before_apply: bool) -> Config {
        Config::builder()
            .api_key("sk-test")
            .model("test-model")
            .base_url("https://example.invalid")
            .ask_before_apply(ask_before_apply)
            .build()
            .unwrap()
    }

    fn done_turn(text: &str) -> ProviderTurn {
        ProviderTurn { blocks: vec![ContentBlock::Text(TextBlock::new(text))], model_used: "test-model".to_string() }
    }

    #[tokio::test]
    async fn test_happy_write_yolo_mode() {
        let backend = Arc::new(MockSpreadsheetBackend::new());
        let journal = Arc::new(UndoJournal::new_in_memory());
        let macro_call = ToolUseBlock::new(
            "call_1",
            "execute_macro",
            serde_json::json!({ "actions": [{ "action": "write_cell", "sheet": "Plan1", "cell": "A1", "value": 42 }] }),
        );
        let provider = StubProvider::new(vec![
            ProviderTurn { blocks: vec![ContentBlock::ToolUse(macro_call)], model_used: "test-model".to_string() },
            done_turn("Done — A1 is now 42."),
        ]);

        let agent = AgentLoop::with_provider(test_config(false), backend, journal.clone(), provider);
        let mut conversation = Conversation::new("conv-1", 0);
        let cancelled = AtomicBool::new(false);

        let outcome = agent
            .send_message(&mut conversation, "Put the value 42 in cell A1 of sheet Plan1.", &cancelled, no_sink())
            .await
            .unwrap();

        match outcome {
            TurnOutcome::Done { text, .. } => assert!(text.contains("42")),
            other => panic!("expected Done, got {other:?}"),
        }

        assert!(conversation.messages.iter().any(|m| m.role == MessageRole::Tool));
    }

    #[tokio::test]
    async fn test_approval_suspend_then_confirm() {
        let backend = Arc::new(MockSpreadsheetBackend::new());
        let journal = Arc::new(UndoJournal::new_in_memory());
        let macro_call = ToolUseBlock::new(
            "call_1",
            "execute_macro",
            serde_json::json!({ "actions": [{ "action": "delete_sheet", "name": "Summary" }] }),
        );
        let provider = StubProvider::new(vec![
            ProviderTurn { blocks: vec![ContentBlock::ToolUse(macro_call)], model_used: "test-model".to_string() },
            done_turn("Deleted Summary."),
        ]);

        backend.apply_macro_action(&crate::backend::MacroAction::CreateSheet { name: "Summary".to_string() }).await.unwrap();

        let agent = AgentLoop::with_provider(test_config(true), backend.clone(), journal, provider);
        let mut conversation = Conversation::new("conv-1", 0);
        let cancelled = AtomicBool::new(false);

        let outcome = agent.send_message(&mut conversation, "Delete sheet Summary.", &cancelled, no_sink()).await.unwrap();
        assert!(matches!(outcome, TurnOutcome::AwaitingApproval(_)));
        assert!(agent.has_pending_action("conv-1"));
        assert!(backend.list_sheets().await.unwrap().contains(&"Summary".to_string()));

        let outcome = agent.confirm_pending_action(&mut conversation, &cancelled, no_sink()).await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Done { .. }));
        assert!(!agent.has_pending_action("conv-1"));
        assert!(!backend.list_sheets().await.unwrap().contains(&"Summary".to_string()));
    }

    #[tokio::test]
    async fn test_approval_suspend_then_reject() {
        let backend = Arc::new(MockSpreadsheetBackend::new());
        let journal = Arc::new(UndoJournal::new_in_memory());
        let macro_call = ToolUseBlock::new(
            "call_1",
            "execute_macro",
            serde_json::json!({ "actions": [{ "action": "delete_sheet", "name": "Summary" }] }),
        );
        let provider = StubProvider::new(vec![
            ProviderTurn { blocks: vec![ContentBlock::ToolUse(macro_call)], model_used: "test-model".to_string() },
            done_turn("Understood, leaving Summary in place."),
        ]);

        backend.apply_macro_action(&crate::backend::MacroAction::CreateSheet { name: "Summary".to_string() }).await.unwrap();

        let agent = AgentLoop::with_provider(test_config(true), backend.clone(), journal, provider);
        let mut conversation = Conversation::new("conv-1", 0);
        let cancelled = AtomicBool::new(false);

        agent.send_message(&mut conversation, "Delete sheet Summary.", &cancelled, no_sink()).await.unwrap();
        let outcome = agent.reject_pending_action(&mut conversation, &cancelled, no_sink()).await.unwrap();

        assert!(matches!(outcome, TurnOutcome::Done { .. }));
        assert!(backend.list_sheets().await.unwrap().contains(&"Summary".to_string()));
        assert!(
            conversation
                .messages
                .iter()
                .any(|m| m.role == MessageRole::Tool && m.text().is_empty() && format!("{:?}", m.content).contains("declined"))
        );
    }

    #[tokio::test]
    async fn test_inline_json_tool_call_extracted() {
        let backend = Arc::new(MockSpreadsheetBackend::new());
        let journal = Arc::new(UndoJournal::new_in_memory());
        let inline_text = "I'll check.\n{\"tool\":\"list_sheets\",\"args\":{}}\nDone.";
        let provider = StubProvider::new(vec![
            ProviderTurn { blocks: vec![ContentBlock::Text(TextBlock::new(inline_text))], model_used: "test-model".to_string() },
            done_turn("Sheet1 is the only sheet."),
        ]);

        let agent = AgentLoop::with_provider(test_config(false), backend, journal, provider);
        let mut conversation = Conversation::new("conv-1", 0);
        let cancelled = AtomicBool::new(false);

        agent.send_message(&mut conversation, "What sheets are there?", &cancelled, no_sink()).await.unwrap();

        let assistant_msg = &conversation.messages[1];
        for block in &assistant_msg.content {
            if let ContentBlock::Text(t) = block {
                assert!(!t.text.contains('{'));
            }
        }
        assert!(conversation.messages.iter().any(|m| m.role == MessageRole::Tool));
    }

    #[tokio::test]
    async fn test_pending_action_blocks_new_send() {
        let backend = Arc::new(MockSpreadsheetBackend::new());
        let journal = Arc::new(UndoJournal::new_in_memory());
        let macro_call = ToolUseBlock::new(
            "call_1",
            "execute_macro",
            serde_json::json!({ "actions": [{ "action": "create_sheet", "name": "Plan1" }] }),
        );
        let provider = StubProvider::new(vec![ProviderTurn {
            blocks: vec![ContentBlock::ToolUse(macro_call)],
            model_used: "test-model".to_string(),
        }]);

        let agent = AgentLoop::with_provider(test_config(true), backend, journal, provider);
        let mut conversation = Conversation::new("conv-1", 0);
        let cancelled = AtomicBool::new(false);

        agent.send_message(&mut conversation, "Add a plan sheet.", &cancelled, no_sink()).await.unwrap();
        assert!(agent.has_pending_action("conv-1"));

        let result = agent.send_message(&mut conversation, "Also add another sheet.", &cancelled, no_sink()).await;
        assert!(matches!(result, Err(Error::PendingAction(_))));
    }

    #[tokio::test]
    async fn test_step_cap_hit() {
        let backend = Arc::new(MockSpreadsheetBackend::new());
        let journal = Arc::new(UndoJournal::new_in_memory());
        let query_call = ToolUseBlock::new("call_loop", "list_sheets", serde_json::json!({}));
        let turns: Vec<ProviderTurn> = (0..DEFAULT_STEP_CAP)
            .map(|_| ProviderTurn { blocks: vec![ContentBlock::ToolUse(query_call.clone())], model_used: "test-model".to_string() })
            .collect();
        let provider = StubProvider::new(turns);

        let agent = AgentLoop::with_provider(test_config(false), backend, journal, provider);
        let mut conversation = Conversation::new("conv-1", 0);
        let cancelled = AtomicBool::new(false);

        let outcome = agent.send_message(&mut conversation, "Keep checking sheets.", &cancelled, no_sink()).await.unwrap();
        assert!(matches!(outcome, TurnOutcome::StepCapHit));
    }
}
