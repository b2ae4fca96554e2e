//! Direct-message persistence on sqlite.
//!
//! The inbound loop hands accepted direct chat text here fire-and-forget;
//! a save failure is logged and never blocks delivery. Read-back powers
//! the conversation-history endpoint.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use relay_core::{RelayError, UserId};
use serde::Serialize;
use std::path::Path;

/// One persisted direct message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StoredMessage {
    /// Row id.
    pub id: i64,
    /// Sender user id.
    pub from_user_id: i64,
    /// Recipient user id.
    pub to_user_id: i64,
    /// Message body.
    pub text: String,
    /// ISO 8601 timestamp (UTC).
    pub created_at: String,
}

/// Pooled sqlite store for direct chat text.
#[derive(Clone)]
pub struct MessageStore {
    pool: Pool<SqliteConnectionManager>,
}

impl MessageStore {
    /// Open (or create) the database at `path` and ensure the schema.
    pub fn open(path: &Path) -> Result<Self, RelayError> {
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .map_err(|e| RelayError::PersistenceFailure(e.to_string()))?;
        let conn = pool
            .get()
            .map_err(|e| RelayError::PersistenceFailure(e.to_string()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS messages (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                from_user_id INTEGER NOT NULL,
                to_user_id   INTEGER NOT NULL,
                text         TEXT NOT NULL,
                created_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_messages_pair
                ON messages (from_user_id, to_user_id, id);",
        )
        .map_err(|e| RelayError::PersistenceFailure(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Persist one direct message.
    pub fn save_direct_message(
        &self,
        from: UserId,
        to: UserId,
        text: &str,
    ) -> Result<(), RelayError> {
        let conn = self
            .pool
            .get()
            .map_err(|e| RelayError::PersistenceFailure(e.to_string()))?;
        let _ = conn
            .execute(
                "INSERT INTO messages (from_user_id, to_user_id, text) VALUES (?1, ?2, ?3)",
                rusqlite::params![from.0, to.0, text],
            )
            .map_err(|e| RelayError::PersistenceFailure(e.to_string()))?;
        Ok(())
    }

    /// Most recent messages between `a` and `b` (either direction),
    /// oldest first.
    pub fn conversation(
        &self,
        a: UserId,
        b: UserId,
        limit: u32,
    ) -> Result<Vec<StoredMessage>, RelayError> {
        let conn = self
            .pool
            .get()
            .map_err(|e| RelayError::PersistenceFailure(e.to_string()))?;
        let mut stmt = conn
            .prepare(
                "SELECT id, from_user_id, to_user_id, text, created_at
                 FROM messages
                 WHERE (from_user_id = ?1 AND to_user_id = ?2)
                    OR (from_user_id = ?2 AND to_user_id = ?1)
                 ORDER BY id DESC
                 LIMIT ?3",
            )
            .map_err(|e| RelayError::PersistenceFailure(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params![a.0, b.0, limit], |row| {
                Ok(StoredMessage {
                    id: row.get(0)?,
                    from_user_id: row.get(1)?,
                    to_user_id: row.get(2)?,
                    text: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })
            .map_err(|e| RelayError::PersistenceFailure(e.to_string()))?;
        let mut messages = rows
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| RelayError::PersistenceFailure(e.to_string()))?;
        messages.reverse();
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, MessageStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::open(&dir.path().join("relay.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn save_and_read_back_both_directions() {
        let (_dir, store) = store();
        store
            .save_direct_message(UserId(1), UserId(2), "hi")
            .unwrap();
        store
            .save_direct_message(UserId(2), UserId(1), "hello back")
            .unwrap();
        store
            .save_direct_message(UserId(1), UserId(3), "unrelated")
            .unwrap();

        let convo = store.conversation(UserId(1), UserId(2), 50).unwrap();
        assert_eq!(convo.len(), 2);
        assert_eq!(convo[0].text, "hi");
        assert_eq!(convo[1].text, "hello back");
        assert_eq!(convo[1].from_user_id, 2);
    }

    #[test]
    fn limit_keeps_most_recent_messages() {
        let (_dir, store) = store();
        for i in 0..5 {
            store
                .save_direct_message(UserId(1), UserId(2), &format!("m{i}"))
                .unwrap();
        }
        let convo = store.conversation(UserId(1), UserId(2), 2).unwrap();
        assert_eq!(convo.len(), 2);
        assert_eq!(convo[0].text, "m3");
        assert_eq!(convo[1].text, "m4");
    }

    #[test]
    fn empty_conversation_is_empty() {
        let (_dir, store) = store();
        assert!(store.conversation(UserId(8), UserId(9), 10).unwrap().is_empty());
    }
}
