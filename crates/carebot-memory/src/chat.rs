//! Persisted chat history.
//!
//! Each chat is one JSON record `{id, created, messages}` stored under the
//! key `chat:<id>`. Appends rewrite the record inside an immediate
//! transaction, so concurrent writers never interleave partial histories.

use carebot_core::error::{CarebotError, Result};
use carebot_core::types::{Message, Role};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::{Deserialize, Serialize};

use crate::storage::{is_constraint_violation, sqlite_error};

/// Key namespace for chat records.
pub const CHAT_PREFIX: &str = "chat:";

/// A conversation and its ordered message history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    /// Unix timestamp (seconds).
    pub created: i64,
    pub messages: Vec<Message>,
}

pub fn chat_key(id: &str) -> String {
    format!("{CHAT_PREFIX}{id}")
}

pub(crate) fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS chats (
            key TEXT PRIMARY KEY,
            id TEXT NOT NULL,
            created INTEGER NOT NULL,
            body TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_chats_created ON chats(created DESC);",
    )
    .map_err(sqlite_error)
}

fn parse_chat(id: &str, body: &str) -> Result<Chat> {
    serde_json::from_str::<Chat>(body).map_err(|e| CarebotError::CorruptChat {
        id: id.to_string(),
        reason: e.to_string(),
    })
}

/// Chat operations over one pooled connection.
pub struct ChatStore<'a> {
    conn: &'a mut Connection,
}

impl<'a> ChatStore<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    /// Create an empty chat. Fails with `ChatExists` on an id collision.
    pub fn create(&mut self, chat_id: &str, created: i64) -> Result<Chat> {
        let chat = Chat {
            id: chat_id.to_string(),
            created,
            messages: vec![],
        };
        let body = serde_json::to_string(&chat)?;
        self.conn
            .execute(
                "INSERT INTO chats (key, id, created, body) VALUES (?1, ?2, ?3, ?4)",
                params![chat_key(chat_id), chat_id, created, body],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    CarebotError::ChatExists(chat_id.to_string())
                } else {
                    sqlite_error(e)
                }
            })?;
        tracing::debug!("Created chat {chat_id}");
        Ok(chat)
    }

    pub fn exists(&self, chat_id: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM chats WHERE key = ?1",
                params![chat_key(chat_id)],
                |row| row.get(0),
            )
            .optional()
            .map_err(sqlite_error)?;
        Ok(found.is_some())
    }

    pub fn get(&self, chat_id: &str) -> Result<Chat> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM chats WHERE key = ?1",
                params![chat_key(chat_id)],
                |row| row.get(0),
            )
            .optional()
            .map_err(sqlite_error)?;
        match body {
            Some(body) => parse_chat(chat_id, &body),
            None => Err(CarebotError::ChatNotFound(chat_id.to_string())),
        }
    }

    /// Append messages in order, atomically.
    pub fn append_messages(&mut self, chat_id: &str, messages: &[Message]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        if let Some(m) = messages.iter().find(|m| m.role == Role::System) {
            return Err(CarebotError::InvalidRequest(format!(
                "system messages are not persisted: {:.40}",
                m.content
            )));
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sqlite_error)?;

        let key = chat_key(chat_id);
        let body: Option<String> = tx
            .query_row("SELECT body FROM chats WHERE key = ?1", params![key], |row| row.get(0))
            .optional()
            .map_err(sqlite_error)?;
        let Some(body) = body else {
            return Err(CarebotError::ChatNotFound(chat_id.to_string()));
        };

        let mut chat = parse_chat(chat_id, &body)?;
        chat.messages.extend(messages.iter().map(Message::persisted));
        let body = serde_json::to_string(&chat)?;

        tx.execute("UPDATE chats SET body = ?1 WHERE key = ?2", params![body, key])
            .map_err(sqlite_error)?;
        tx.commit().map_err(sqlite_error)?;

        tracing::debug!("Appended {} message(s) to chat {chat_id}", messages.len());
        Ok(())
    }

    /// Full history, or the most recent `last_n` messages.
    pub fn get_messages(&self, chat_id: &str, last_n: Option<usize>) -> Result<Vec<Message>> {
        let chat = self.get(chat_id)?;
        let mut messages = chat.messages;
        if let Some(n) = last_n {
            let skip = messages.len().saturating_sub(n);
            messages.drain(..skip);
        }
        Ok(messages)
    }

    /// All chats, newest first. Corrupted records are skipped and logged.
    pub fn list_chats(&self) -> Result<Vec<Chat>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, body FROM chats ORDER BY created DESC, id ASC")
            .map_err(sqlite_error)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(sqlite_error)?;

        let mut chats = Vec::new();
        for row in rows {
            let (id, body) = row.map_err(sqlite_error)?;
            match parse_chat(&id, &body) {
                Ok(chat) => chats.push(chat),
                Err(e) => tracing::warn!("Skipping unusable chat: {e}"),
            }
        }
        Ok(chats)
    }

    pub fn count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM chats", [], |r| r.get(0))
            .map_err(sqlite_error)?;
        Ok(n as usize)
    }

    /// Drop every chat and recreate the table.
    pub fn reset(&mut self) -> Result<()> {
        let tx = self.conn.transaction().map_err(sqlite_error)?;
        tx.execute_batch("DROP TABLE IF EXISTS chats;").map_err(sqlite_error)?;
        ensure_schema(&tx)?;
        tx.commit().map_err(sqlite_error)?;
        tracing::info!("Chat history cleared");
        Ok(())
    }
}
