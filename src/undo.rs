//! Undo Journal: per-action inverse-operation log keyed by conversation and
//! batch, replay on undo, approval marks records final.

use rusqlite::Connection;
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::Result;
use crate::backend::{MacroAction, SpreadsheetBackend};

/// A monotonic, nanosecond-derived batch id — every agent-loop turn starts a
/// new one.
pub fn new_batch_id() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos() as i64
}

/// One inverse-operation record.
#[derive(Debug, Clone, PartialEq)]
pub struct UndoAction {
    pub conversation_id: String,
    pub batch_id: i64,
    pub sequence: i64,
    pub op_type: String,
    pub sheet: String,
    pub cell_or_range: String,
    pub old_value: Value,
    pub undo_data: Value,
    pub approved: bool,
}

fn sheet_and_target(action: &MacroAction) -> (String, String) {
    match action {
        MacroAction::WriteCell { sheet, cell, .. } => (sheet.clone(), cell.clone()),
        MacroAction::WriteRange { sheet, range, .. } => (sheet.clone(), range.clone()),
        MacroAction::CreateSheet { name } => (name.clone(), String::new()),
        MacroAction::DeleteSheet { name } => (name.clone(), String::new()),
        MacroAction::RenameSheet { new_name, .. } => (new_name.clone(), String::new()),
        MacroAction::MergeCells { sheet, range } => (sheet.clone(), range.clone()),
        MacroAction::InsertRows { sheet, row, .. } => (sheet.clone(), row.to_string()),
        MacroAction::DeleteRows { sheet, row, .. } => (sheet.clone(), row.to_string()),
        MacroAction::ClearRange { sheet, range } => (sheet.clone(), range.clone()),
        MacroAction::SortRange { sheet, range, .. } => (sheet.clone(), range.clone()),
        MacroAction::SetColumnWidth { sheet, column, .. } => (sheet.clone(), column.to_string()),
        MacroAction::SetRowHeight { sheet, row, .. } => (sheet.clone(), row.to_string()),
        MacroAction::FormatRange { sheet, range, .. } => (sheet.clone(), range.clone()),
        MacroAction::CreateChart { sheet, range, .. } => (sheet.clone(), range.clone()),
    }
}

/// Persistent, per-conversation inverse-operation log.
pub struct UndoJournal {
    conn: Mutex<Connection>,
}

impl UndoJournal {
    /// Open (or create) the journal table on an existing connection, shared
    /// with the rest of the persisted state layout.
    pub fn new(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS undo_actions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conv_id TEXT NOT NULL,
                batch_id INTEGER NOT NULL,
                seq INTEGER NOT NULL,
                op_type TEXT NOT NULL,
                sheet TEXT NOT NULL,
                cell_or_range TEXT NOT NULL,
                old_value TEXT NOT NULL,
                undo_data TEXT NOT NULL,
                approved INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_undo_conv_batch_seq
                ON undo_actions(conv_id, batch_id, seq);",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn new_in_memory() -> Self {
        let conn = Connection::open_in_memory().expect("open in-memory sqlite connection");
        Self::new(conn).expect("bootstrap undo_actions schema")
    }

    /// Write one inverse record for a just-applied, undoable macro action.
    pub async fn record(&self, conversation_id: &str, batch_id: i64, action: &MacroAction, old_state: Value) -> Result<UndoAction> {
        let (sheet, target) = sheet_and_target(action);
        let conn = self.conn.lock().await;

        let sequence: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM undo_actions WHERE conv_id = ?1 AND batch_id = ?2",
            (conversation_id, batch_id),
            |row| row.get(0),
        )?;

        let old_value_str = old_state.to_string();
        conn.execute(
            "INSERT INTO undo_actions (conv_id, batch_id, seq, op_type, sheet, cell_or_range, old_value, undo_data, approved)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)",
            (
                conversation_id,
                batch_id,
                sequence,
                action.op_type(),
                &sheet,
                &target,
                &old_value_str,
                &old_value_str,
            ),
        )?;

        debug!(conversation_id, batch_id, sequence, op_type = action.op_type(), "recorded undo action");

        Ok(UndoAction {
            conversation_id: conversation_id.to_string(),
            batch_id,
            sequence,
            op_type: action.op_type().to_string(),
            sheet,
            cell_or_range: target,
            old_value: old_state.clone(),
            undo_data: old_state,
            approved: false,
        })
    }

    /// Remove a record outright (used when a dispatch's later sub-action
    /// fails and this one is compensated inline rather than via user undo).
    pub async fn discard(&self, record: &UndoAction) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM undo_actions WHERE conv_id = ?1 AND batch_id = ?2 AND seq = ?3",
            (&record.conversation_id, record.batch_id, record.sequence),
        )?;
        Ok(())
    }

    pub async fn records_for_batch(&self, conversation_id: &str, batch_id: i64) -> Result<Vec<UndoAction>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT seq, op_type, sheet, cell_or_range, old_value, undo_data, approved
             FROM undo_actions WHERE conv_id = ?1 AND batch_id = ?2 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map((conversation_id, batch_id), |row| {
            let old_value: String = row.get(4)?;
            let undo_data: String = row.get(5)?;
            Ok(UndoAction {
                conversation_id: conversation_id.to_string(),
                batch_id,
                sequence: row.get(0)?,
                op_type: row.get(1)?,
                sheet: row.get(2)?,
                cell_or_range: row.get(3)?,
                old_value: serde_json::from_str(&old_value).unwrap_or(Value::Null),
                undo_data: serde_json::from_str(&undo_data).unwrap_or(Value::Null),
                approved: row.get::<_, i64>(6)? != 0,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    async fn latest_batch_id(&self, conversation_id: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT batch_id FROM undo_actions WHERE conv_id = ?1 ORDER BY batch_id DESC LIMIT 1",
            (conversation_id,),
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| if e == rusqlite::Error::QueryReturnedNoRows { Ok(None) } else { Err(e.into()) })
    }

    /// `UndoByConversation(convID)`: undo the latest batch in reverse
    /// insertion order, then delete those records. Returns the count undone
    /// (0 if the latest batch is already approved — a no-op).
    pub async fn undo_by_conversation(&self, conversation_id: &str, backend: &dyn SpreadsheetBackend) -> Result<usize> {
        let Some(batch_id) = self.latest_batch_id(conversation_id).await? else {
            return Ok(0);
        };

        let mut records = self.records_for_batch(conversation_id, batch_id).await?;
        if records.iter().any(|r| r.approved) {
            debug!(conversation_id, batch_id, "undo no-op: batch already approved");
            return Ok(0);
        }

        records.sort_by(|a, b| b.sequence.cmp(&a.sequence));

        let mut undone = 0;
        for record in &records {
            if let Err(e) = backend
                .apply_inverse(&record.op_type, &record.sheet, &record.cell_or_range, &record.undo_data)
                .await
            {
                warn!(conversation_id, batch_id, error = %e, "corrupt undo data, aborting replay");
                return Err(crate::Error::undo(format!("replay failed at seq {}: {e}", record.sequence)));
            }
            undone += 1;
        }

        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM undo_actions WHERE conv_id = ?1 AND batch_id = ?2",
            (conversation_id, batch_id),
        )?;

        Ok(undone)
    }

    /// `ApproveActions(convID)`: mark all pending records for this
    /// conversation as approved (audit trail, no longer undo candidates).
    pub async fn approve_actions(&self, conversation_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE undo_actions SET approved = 1 WHERE conv_id = ?1",
            (conversation_id,),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockSpreadsheetBackend;

    #[tokio::test]
    async fn test_record_and_undo_write_cell() {
        let backend = MockSpreadsheetBackend::new();
        let journal = UndoJournal::new_in_memory();

        let action = MacroAction::WriteCell {
            sheet: "Sheet1".to_string(),
            cell: "A1".to_string(),
            value: serde_json::json!(1),
        };
        backend.apply_macro_action(&action).await.unwrap();
        journal.record("conv-1", 1, &action, Value::Null).await.unwrap();

        let undone = journal.undo_by_conversation("conv-1", &backend).await.unwrap();
        assert_eq!(undone, 1);
        assert_eq!(journal.records_for_batch("conv-1", 1).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_approved_batch_is_noop_on_undo() {
        let backend = MockSpreadsheetBackend::new();
        let journal = UndoJournal::new_in_memory();

        let action = MacroAction::CreateSheet { name: "Plan1".to_string() };
        backend.apply_macro_action(&action).await.unwrap();
        journal.record("conv-1", 1, &action, Value::Null).await.unwrap();
        journal.approve_actions("conv-1").await.unwrap();

        let undone = journal.undo_by_conversation("conv-1", &backend).await.unwrap();
        assert_eq!(undone, 0);
        assert!(backend.list_sheets().await.unwrap().contains(&"Plan1".to_string()));
    }

    #[tokio::test]
    async fn test_undo_reverse_order_within_batch() {
        let backend = MockSpreadsheetBackend::new();
        let journal = UndoJournal::new_in_memory();

        let a1 = MacroAction::CreateSheet { name: "A".to_string() };
        let a2 = MacroAction::CreateSheet { name: "B".to_string() };
        backend.apply_macro_action(&a1).await.unwrap();
        backend.apply_macro_action(&a2).await.unwrap();
        journal.record("conv-1", 1, &a1, Value::Null).await.unwrap();
        journal.record("conv-1", 1, &a2, Value::Null).await.unwrap();

        let records = journal.records_for_batch("conv-1", 1).await.unwrap();
        assert_eq!(records[0].sequence, 1);
        assert_eq!(records[1].sequence, 2);

        journal.undo_by_conversation("conv-1", &backend).await.unwrap();
        assert!(!backend.list_sheets().await.unwrap().contains(&"A".to_string()));
        assert!(!backend.list_sheets().await.unwrap().contains(&"B".to_string()));
    }

    #[test]
    fn test_new_batch_id_monotonic() {
        let a = new_batch_id();
        let b = new_batch_id();
        assert!(b >= a);
    }
}
