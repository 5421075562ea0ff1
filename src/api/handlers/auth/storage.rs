//! Session persistence.
//!
//! Sessions are keyed by the SHA-256 hash of the cookie token. Stores only
//! answer "which user owns this unexpired hash"; turning that into a [`User`]
//! is the accessor's job.
//!
//! [`User`]: crate::users::User

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::Instrument;
use uuid::Uuid;

use super::utils::is_unique_violation;

/// Row written when a session is created.
#[derive(Debug)]
pub struct NewSession {
    pub token_hash: Vec<u8>,
    pub user_id: Uuid,
    pub ttl_seconds: i64,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a session. `Ok(false)` means the hash already exists and the
    /// caller should retry with a fresh token.
    async fn insert(&self, session: NewSession) -> Result<bool>;

    /// Owner of an unexpired session.
    async fn lookup(&self, token_hash: &[u8]) -> Result<Option<Uuid>>;

    /// Idempotent delete.
    async fn delete(&self, token_hash: &[u8]) -> Result<()>;

    /// Remove every session of a user in one step; returns how many went away.
    async fn delete_all_for_user(&self, user_id: Uuid) -> Result<u64>;

    async fn purge_expired(&self) -> Result<u64>;
}

struct MemorySession {
    user_id: Uuid,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<Vec<u8>, MemorySession>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sessions currently held for a user, expired or not.
    pub async fn count_for_user(&self, user_id: Uuid) -> usize {
        self.sessions
            .lock()
            .await
            .values()
            .filter(|session| session.user_id == user_id)
            .count()
    }

    /// Push every session into the past.
    pub async fn expire_all(&self) {
        let past = Utc::now() - Duration::seconds(1);
        for session in self.sessions.lock().await.values_mut() {
            session.expires_at = past;
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, session: NewSession) -> Result<bool> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&session.token_hash) {
            return Ok(false);
        }
        sessions.insert(
            session.token_hash,
            MemorySession {
                user_id: session.user_id,
                expires_at: Utc::now() + Duration::seconds(session.ttl_seconds),
            },
        );
        Ok(true)
    }

    async fn lookup(&self, token_hash: &[u8]) -> Result<Option<Uuid>> {
        let now = Utc::now();
        Ok(self
            .sessions
            .lock()
            .await
            .get(token_hash)
            .filter(|session| session.expires_at > now)
            .map(|session| session.user_id))
    }

    async fn delete(&self, token_hash: &[u8]) -> Result<()> {
        self.sessions.lock().await.remove(token_hash);
        Ok(())
    }

    async fn delete_all_for_user(&self, user_id: Uuid) -> Result<u64> {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, session| session.user_id != user_id);
        Ok(u64::try_from(before - sessions.len()).unwrap_or(u64::MAX))
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, session| session.expires_at > now);
        Ok(u64::try_from(before - sessions.len()).unwrap_or(u64::MAX))
    }
}

pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn insert(&self, session: NewSession) -> Result<bool> {
        let query = r"
            INSERT INTO user_sessions (user_id, session_hash, expires_at)
            VALUES ($1, $2, NOW() + ($3 * INTERVAL '1 second'))
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(session.user_id)
            .bind(&session.token_hash)
            .bind(session.ttl_seconds)
            .execute(&self.pool)
            .instrument(span)
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(err) if is_unique_violation(&err) => Ok(false),
            Err(err) => Err(err).context("failed to insert session"),
        }
    }

    async fn lookup(&self, token_hash: &[u8]) -> Result<Option<Uuid>> {
        let query = r"
            SELECT user_id
            FROM user_sessions
            WHERE session_hash = $1
              AND expires_at > NOW()
            LIMIT 1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup session")?;
        Ok(row.map(|row| row.get("user_id")))
    }

    async fn delete(&self, token_hash: &[u8]) -> Result<()> {
        // Logout is idempotent; it's fine if no rows are deleted.
        let query = "DELETE FROM user_sessions WHERE session_hash = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(token_hash)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to delete session")?;
        Ok(())
    }

    async fn delete_all_for_user(&self, user_id: Uuid) -> Result<u64> {
        let query = "DELETE FROM user_sessions WHERE user_id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to delete user sessions")?;
        Ok(result.rows_affected())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let query = "DELETE FROM user_sessions WHERE expires_at <= NOW()";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to purge expired sessions")?;
        Ok(result.rows_affected())
    }
}
