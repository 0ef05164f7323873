//! Conversation history, keyed by session id.
//!
//! History is append-only: each turn gets the next sequence number within its
//! session. [`SessionLocks`] hands out one async mutex per session so callers
//! can serialize a read-history → append critical section.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OwnedMutexGuard;

use crate::models::ChatTurn;

/// Storage for chat session history.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// All turns of `session_id` in the order they were appended. Unknown
    /// sessions have an empty history.
    async fn history(&self, session_id: &str) -> Result<Vec<ChatTurn>>;

    /// Append one turn to `session_id`, creating the session if needed.
    async fn append(&self, session_id: &str, turn: &ChatTurn) -> Result<()>;
}

pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn history(&self, session_id: &str) -> Result<Vec<ChatTurn>> {
        let rows = sqlx::query(
            "SELECT query, response FROM chat_messages WHERE session_id = ? ORDER BY seq",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ChatTurn {
                query: row.get("query"),
                response: row.get("response"),
            })
            .collect())
    }

    async fn append(&self, session_id: &str, turn: &ChatTurn) -> Result<()> {
        // seq is computed inside the INSERT
        sqlx::query(
            r#"
            INSERT INTO chat_messages (session_id, seq, query, response, created_at)
            VALUES (
                ?,
                (SELECT COALESCE(MAX(seq), -1) + 1 FROM chat_messages WHERE session_id = ?),
                ?, ?, ?
            )
            "#,
        )
        .bind(session_id)
        .bind(session_id)
        .bind(&turn.query)
        .bind(&turn.response)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// One async mutex per session id, kept only while someone holds or awaits it.
#[derive(Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Exclusive access to one session. Dropping it releases the lock and
/// forgets the session once nobody else is waiting on it.
pub struct SessionGuard<'a> {
    locks: &'a SessionLocks,
    session_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Wait for exclusive access to `session_id`. Callers hold the guard
    /// across the history read and the append.
    pub async fn acquire(&self, session_id: &str) -> SessionGuard<'_> {
        // created first so a cancelled wait still prunes the entry
        let mut session = SessionGuard {
            locks: self,
            session_id: session_id.to_string(),
            guard: None,
        };
        let lock = self
            .map()
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        session.guard = Some(lock.lock_owned().await);
        session
    }

    /// Number of sessions currently locked or awaited.
    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn prune(&self, session_id: &str) {
        let mut map = self.map();
        // only the map's own handle left: no holder, no waiter
        if map
            .get(session_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            map.remove(session_id);
        }
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks.prune(&self.session_id);
    }
}
