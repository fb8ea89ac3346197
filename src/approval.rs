//! Approval Gate: suspends the agent loop ahead of a mutating `execute_macro`
//! call until the host confirms or rejects it.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::Result;
use crate::backend::MacroAction;
use crate::types::ToolCall;

/// A mutating tool call awaiting the host's confirm/reject decision.
#[derive(Debug, Clone)]
pub struct PendingAction {
    pub conversation_id: String,
    pub batch_id: i64,
    pub tool_call_id: String,
    pub actions: Vec<MacroAction>,
    pub created_at: i64,
}

/// Tracks at most one pending action per conversation. A conversation with a
/// pending action rejects any new `SendMessage` until it is resolved.
#[derive(Default)]
pub struct ApprovalGate {
    pending: Mutex<HashMap<String, PendingAction>>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspend the loop on this conversation ahead of a macro dispatch.
    /// Overwrites any stale entry — the caller is expected to have already
    /// checked `has_pending_action`.
    pub fn suspend(&self, conversation_id: &str, batch_id: i64, call: &ToolCall, created_at: i64) -> Result<PendingAction> {
        let actions: Vec<MacroAction> = serde_json::from_value(
            call.input
                .get("actions")
                .cloned()
                .ok_or_else(|| crate::Error::invalid_input("execute_macro call missing actions"))?,
        )?;

        let action = PendingAction {
            conversation_id: conversation_id.to_string(),
            batch_id,
            tool_call_id: call.id.clone(),
            actions,
            created_at,
        };

        self.pending
            .lock()
            .unwrap()
            .insert(conversation_id.to_string(), action.clone());

        Ok(action)
    }

    pub fn has_pending_action(&self, conversation_id: &str) -> bool {
        self.pending.lock().unwrap().contains_key(conversation_id)
    }

    pub fn peek(&self, conversation_id: &str) -> Option<PendingAction> {
        self.pending.lock().unwrap().get(conversation_id).cloned()
    }

    /// `ConfirmPendingAction`: clear and return the pending action so the
    /// caller can dispatch it for real.
    pub fn confirm(&self, conversation_id: &str) -> Result<PendingAction> {
        self.pending
            .lock()
            .unwrap()
            .remove(conversation_id)
            .ok_or_else(|| crate::Error::pending_action(format!("no pending action for {conversation_id}")))
    }

    /// `RejectPendingAction`: clear and return the pending action so the
    /// caller can synthesize a declined tool-result message.
    pub fn reject(&self, conversation_id: &str) -> Result<PendingAction> {
        self.pending
            .lock()
            .unwrap()
            .remove(conversation_id)
            .ok_or_else(|| crate::Error::pending_action(format!("no pending action for {conversation_id}")))
    }
}
