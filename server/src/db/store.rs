//! Persistence collaborators consumed by the connection hub.
//!
//! The traits are synchronous (rusqlite is); async callers go through
//! [`crate::db::blocking`].

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::OptionalExtension;
use std::sync::{Arc, MutexGuard};

use super::models::{ChatMessage, ChatUser, Identity, StoredMessage, UserSummary};
use super::{DbPool, StoreError};
use crate::hub::presence::PresenceStatus;

pub trait UserStore: Send + Sync {
    fn user_by_id(&self, id: Identity) -> Result<Option<UserSummary>, StoreError>;
}

pub trait MessageStore: Send + Sync {
    fn insert_message(
        &self,
        from: Identity,
        to: Identity,
        content: &str,
    ) -> Result<StoredMessage, StoreError>;
    /// Messages exchanged between `a` and `b` in either direction, newest first.
    fn messages_between(
        &self,
        a: Identity,
        b: Identity,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, StoreError>;
    fn count_between(&self, a: Identity, b: Identity) -> Result<u64, StoreError>;
}

pub trait PresenceStore: Send + Sync {
    /// Upsert the persisted status. An empty `display_name` keeps the stored one.
    fn set_presence(
        &self,
        identity: Identity,
        status: PresenceStatus,
        display_name: &str,
    ) -> Result<(), StoreError>;
}

pub trait SessionStore: Send + Sync {
    /// Resolve a `session_id` cookie value. Expired sessions are deleted.
    fn user_for_session(&self, session_id: &str) -> Result<Option<Identity>, StoreError>;
    /// Remove a session row, returning the identity it belonged to.
    fn delete_session(&self, session_id: &str) -> Result<Option<Identity>, StoreError>;
}

pub trait RosterStore: Send + Sync {
    fn chat_users(&self, current: Identity) -> Result<Vec<ChatUser>, StoreError>;
}

/// Bundle of collaborator handles shared by the hub and the REST handlers.
#[derive(Clone)]
pub struct Stores {
    pub users: Arc<dyn UserStore>,
    pub messages: Arc<dyn MessageStore>,
    pub presence: Arc<dyn PresenceStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub roster: Arc<dyn RosterStore>,
}

impl Stores {
    /// All collaborators backed by the same SQLite connection.
    pub fn sqlite(db: DbPool) -> Self {
        let store = Arc::new(SqliteStore::new(db));
        Self {
            users: store.clone(),
            messages: store.clone(),
            presence: store.clone(),
            sessions: store.clone(),
            roster: store,
        }
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Clone)]
pub struct SqliteStore {
    db: DbPool,
}

impl SqliteStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    fn conn(&self) -> Result<MutexGuard<'_, rusqlite::Connection>, StoreError> {
        self.db.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

impl UserStore for SqliteStore {
    fn user_by_id(&self, id: Identity) -> Result<Option<UserSummary>, StoreError> {
        let conn = self.conn()?;
        let user = conn
            .query_row(
                "SELECT id, username FROM users WHERE id = ?1",
                rusqlite::params![id],
                |row| {
                    Ok(UserSummary {
                        id: row.get(0)?,
                        username: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }
}

impl MessageStore for SqliteStore {
    fn insert_message(
        &self,
        from: Identity,
        to: Identity,
        content: &str,
    ) -> Result<StoredMessage, StoreError> {
        let conn = self.conn()?;
        let created_at = now_rfc3339();
        conn.execute(
            "INSERT INTO messages (from_user, to_user, content, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![from, to, content, created_at],
        )?;
        Ok(StoredMessage {
            id: conn.last_insert_rowid(),
            created_at,
        })
    }

    fn messages_between(
        &self,
        a: Identity,
        b: Identity,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, from_user, to_user, content, created_at
             FROM messages
             WHERE (from_user = ?1 AND to_user = ?2) OR (from_user = ?2 AND to_user = ?1)
             ORDER BY created_at DESC, id DESC
             LIMIT ?3 OFFSET ?4",
        )?;
        let messages = stmt
            .query_map(rusqlite::params![a, b, limit, offset], |row| {
                Ok(ChatMessage {
                    id: row.get(0)?,
                    from: row.get(1)?,
                    to: row.get(2)?,
                    content: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    fn count_between(&self, a: Identity, b: Identity) -> Result<u64, StoreError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages
             WHERE (from_user = ?1 AND to_user = ?2) OR (from_user = ?2 AND to_user = ?1)",
            rusqlite::params![a, b],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}

impl PresenceStore for SqliteStore {
    fn set_presence(
        &self,
        identity: Identity,
        status: PresenceStatus,
        display_name: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let nickname = (!display_name.is_empty()).then_some(display_name);
        conn.execute(
            "INSERT INTO presence (user_id, status, nickname, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id) DO UPDATE SET
                status = excluded.status,
                nickname = COALESCE(excluded.nickname, presence.nickname),
                updated_at = excluded.updated_at",
            rusqlite::params![identity, status.as_str(), nickname, now_rfc3339()],
        )?;
        Ok(())
    }
}

impl SessionStore for SqliteStore {
    fn user_for_session(&self, session_id: &str) -> Result<Option<Identity>, StoreError> {
        let conn = self.conn()?;
        let row: Option<(Identity, String)> = conn
            .query_row(
                "SELECT user_id, expires_at FROM sessions WHERE id = ?1",
                rusqlite::params![session_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((user_id, expires_at)) = row else {
            return Ok(None);
        };

        let live = DateTime::parse_from_rfc3339(&expires_at)
            .map(|exp| exp.with_timezone(&Utc) > Utc::now())
            .unwrap_or(false);
        if !live {
            conn.execute(
                "DELETE FROM sessions WHERE id = ?1",
                rusqlite::params![session_id],
            )?;
            tracing::debug!(user_id, "Dropped expired or malformed session");
            return Ok(None);
        }

        Ok(Some(user_id))
    }

    fn delete_session(&self, session_id: &str) -> Result<Option<Identity>, StoreError> {
        let conn = self.conn()?;
        let owner: Option<Identity> = conn
            .query_row(
                "SELECT user_id FROM sessions WHERE id = ?1",
                rusqlite::params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        conn.execute(
            "DELETE FROM sessions WHERE id = ?1",
            rusqlite::params![session_id],
        )?;
        Ok(owner)
    }
}

impl RosterStore for SqliteStore {
    fn chat_users(&self, current: Identity) -> Result<Vec<ChatUser>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT u.id, u.username, COALESCE(p.status, 'offline'), MAX(m.created_at)
             FROM users u
             LEFT JOIN presence p ON p.user_id = u.id
             LEFT JOIN messages m
                ON (m.from_user = u.id AND m.to_user = ?1)
                OR (m.from_user = ?1 AND m.to_user = u.id)
             WHERE u.id != ?1
             GROUP BY u.id
             ORDER BY
                CASE WHEN MAX(m.created_at) IS NULL THEN 1 ELSE 0 END,
                MAX(m.created_at) DESC,
                u.username COLLATE NOCASE ASC",
        )?;
        let users = stmt
            .query_map(rusqlite::params![current], |row| {
                Ok(ChatUser {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    status: row.get(2)?,
                    last_message_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }
}
