//! Conversation Store: SQLite-backed persistence for conversations, their
//! message history, and small process-wide key/value config overrides.
//!
//! Schema is bootstrapped idempotently (`CREATE TABLE IF NOT EXISTS`) so the
//! same file can be reopened across process restarts without a migration
//! step.

use rusqlite::{Connection, OptionalExtension, params};

use crate::Result;
use crate::types::{Conversation, ConversationSummary, Message};

pub struct ConversationStore {
    conn: Connection,
}

impl ConversationStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::bootstrap(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::bootstrap(&conn)?;
        Ok(Self { conn })
    }

    fn bootstrap(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL DEFAULT '',
                context TEXT NOT NULL DEFAULT '',
                excel_file_path TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                seq INTEGER NOT NULL,
                message_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conv_seq
                ON messages(conversation_id, seq);
            CREATE TABLE IF NOT EXISTS config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_updated_at
                ON conversations(updated_at);",
        )?;
        Ok(())
    }

    /// `NewConversation`: insert an empty conversation row.
    pub fn new_conversation(&self, id: &str, created_at: i64) -> Result<Conversation> {
        self.conn.execute(
            "INSERT INTO conversations (id, title, context, excel_file_path, created_at, updated_at)
             VALUES (?1, '', '', NULL, ?2, ?2)",
            params![id, created_at],
        )?;
        Ok(Conversation::new(id, created_at))
    }

    /// `ListConversations`: summaries ordered most-recently-updated first.
    pub fn list(&self) -> Result<Vec<ConversationSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, context, excel_file_path, created_at, updated_at
             FROM conversations ORDER BY updated_at DESC",
        )?;
        let conv_rows: Vec<(String, String, String, Option<String>, i64, i64)> = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut summaries = Vec::with_capacity(conv_rows.len());
        for (id, title, context, excel_file_path, created_at, updated_at) in conv_rows {
            let messages = self.load_messages(&id)?;
            let conv = Conversation {
                id,
                title,
                messages,
                context,
                excel_file_path,
                created_at,
                updated_at,
            };
            summaries.push(ConversationSummary::from(&conv));
        }
        Ok(summaries)
    }

    /// `LoadConversation`: full message history plus metadata.
    pub fn load(&self, id: &str) -> Result<Option<Conversation>> {
        let row = self
            .conn
            .query_row(
                "SELECT title, context, excel_file_path, created_at, updated_at
                 FROM conversations WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((title, context, excel_file_path, created_at, updated_at)) = row else {
            return Ok(None);
        };

        Ok(Some(Conversation {
            id: id.to_string(),
            title,
            messages: self.load_messages(id)?,
            context,
            excel_file_path,
            created_at,
            updated_at,
        }))
    }

    fn load_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let mut stmt = self.conn.prepare(
            "SELECT message_json FROM messages WHERE conversation_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![conversation_id], |row| row.get::<_, String>(0))?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(serde_json::from_str(&row?)?);
        }
        Ok(messages)
    }

    /// `SaveConversation`: replace the full message list and bump metadata.
    /// Call after every turn (the agent loop prunes in memory first via
    /// [`crate::context::prune_to_budget`] — this persists whatever the
    /// caller hands it, pruned or not).
    pub fn save(&mut self, conversation: &Conversation) -> Result<()> {
        let tx = self.conn.transaction()?;

        tx.execute(
            "INSERT INTO conversations (id, title, context, excel_file_path, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                context = excluded.context,
                excel_file_path = excluded.excel_file_path,
                updated_at = excluded.updated_at",
            params![
                conversation.id,
                conversation.title,
                conversation.context,
                conversation.excel_file_path,
                conversation.created_at,
                conversation.updated_at,
            ],
        )?;

        tx.execute("DELETE FROM messages WHERE conversation_id = ?1", params![conversation.id])?;
        for (seq, message) in conversation.messages.iter().enumerate() {
            let json = serde_json::to_string(message)?;
            tx.execute(
                "INSERT INTO messages (conversation_id, seq, message_json) VALUES (?1, ?2, ?3)",
                params![conversation.id, seq as i64, json],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// `DeleteConversation`.
    pub fn delete(&self, id: &str) -> Result<()> {
        self.conn.execute("DELETE FROM messages WHERE conversation_id = ?1", params![id])?;
        self.conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn set_excel_path(&self, id: &str, path: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE conversations SET excel_file_path = ?1 WHERE id = ?2",
            params![path, id],
        )?;
        Ok(())
    }

    pub fn get_excel_path(&self, id: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT excel_file_path FROM conversations WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map(Option::flatten)
    }

    pub fn set_config_value(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_config_value(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row("SELECT value FROM config WHERE key = ?1", params![key], |row| row.get(0))
            .optional()
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    #[test]
    fn test_new_conversation_then_load() {
        let store = ConversationStore::open_in_memory().unwrap();
        store.new_conversation("c1", 100).unwrap();
        let loaded = store.load("c1").unwrap().unwrap();
        assert_eq!(loaded.id, "c1");
        assert!(loaded.messages.is_empty());
    }

    #[test]
    fn test_save_round_trips_messages() {
        let mut store = ConversationStore::open_in_memory().unwrap();
        let mut conv = store.new_conversation("c1", 100).unwrap();
        conv.messages.push(Message::user("Put 42 in A1"));
        conv.messages.push(Message::assistant("Done."));
        conv.updated_at = 200;
        store.save(&conv).unwrap();

        let loaded = store.load("c1").unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.messages[0].text(), "Put 42 in A1");
        assert_eq!(loaded.updated_at, 200);
    }

    #[test]
    fn test_list_orders_by_updated_at_desc() {
        let mut store = ConversationStore::open_in_memory().unwrap();
        let mut c1 = store.new_conversation("c1", 100).unwrap();
        c1.updated_at = 100;
        store.save(&c1).unwrap();
        let mut c2 = store.new_conversation("c2", 150).unwrap();
        c2.updated_at = 300;
        store.save(&c2).unwrap();

        let list = store.list().unwrap();
        assert_eq!(list[0].id, "c2");
        assert_eq!(list[1].id, "c1");
    }

    #[test]
    fn test_delete_removes_conversation_and_messages() {
        let mut store = ConversationStore::open_in_memory().unwrap();
        let mut conv = store.new_conversation("c1", 100).unwrap();
        conv.messages.push(Message::user("hi"));
        store.save(&conv).unwrap();

        store.delete("c1").unwrap();
        assert!(store.load("c1").unwrap().is_none());
    }

    #[test]
    fn test_excel_path_round_trip() {
        let store = ConversationStore::open_in_memory().unwrap();
        store.new_conversation("c1", 100).unwrap();
        assert_eq!(store.get_excel_path("c1").unwrap(), None);
        store.set_excel_path("c1", "/tmp/book.xlsx").unwrap();
        assert_eq!(store.get_excel_path("c1").unwrap(), Some("/tmp/book.xlsx".to_string()));
    }

    #[test]
    fn test_config_value_round_trip() {
        let store = ConversationStore::open_in_memory().unwrap();
        assert_eq!(store.get_config_value("model").unwrap(), None);
        store.set_config_value("model", "gpt-4o").unwrap();
        assert_eq!(store.get_config_value("model").unwrap(), Some("gpt-4o".to_string()));
    }
}
