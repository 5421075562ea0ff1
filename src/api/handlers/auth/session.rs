//! Session accessor and cookie helpers.
//!
//! The cookie carries only the opaque token; every lookup hashes it first.
//! Missing, malformed, expired and orphaned sessions all resolve to `None`.

use anyhow::{Result, anyhow};
use axum::http::{
    HeaderMap, HeaderValue,
    header::InvalidHeaderValue,
};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::{
    state::{AuthConfig, SESSION_COOKIE_NAME},
    storage::{NewSession, SessionStore},
    token::{self, TokenKind},
    utils::read_cookie,
};
use crate::users::{ServiceError, User, UserService};

const INSERT_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct Sessions {
    store: Arc<dyn SessionStore>,
    ttl_seconds: i64,
}

impl Sessions {
    pub fn new(store: Arc<dyn SessionStore>, ttl_seconds: i64) -> Self {
        Self { store, ttl_seconds }
    }

    #[must_use]
    pub fn store(&self) -> &dyn SessionStore {
        self.store.as_ref()
    }

    /// Create a session for the user and return the raw cookie token.
    ///
    /// # Errors
    /// Returns an error if the store fails or no unique token could be found.
    pub async fn create_session(&self, user_id: Uuid) -> Result<String> {
        for _ in 0..INSERT_ATTEMPTS {
            let issued = token::issue(TokenKind::Session)?;
            let inserted = self
                .store
                .insert(NewSession {
                    token_hash: issued.hash,
                    user_id,
                    ttl_seconds: self.ttl_seconds,
                })
                .await?;
            if inserted {
                debug!(%user_id, "session created");
                return Ok(issued.raw);
            }
        }
        Err(anyhow!("failed to generate unique session token"))
    }

    /// Resolve a raw token into its user. `Ok(None)` means unauthenticated.
    ///
    /// # Errors
    /// Returns an error only when a backing store fails.
    pub async fn resolve_session(
        &self,
        raw: &str,
        users: &dyn UserService,
    ) -> Result<Option<User>> {
        if !token::looks_like_token(raw) {
            return Ok(None);
        }
        let Some(user_id) = self.store.lookup(&token::hash_token(raw)).await? else {
            return Ok(None);
        };
        match users.get_by_id(user_id).await {
            Ok(user) => Ok(Some(user)),
            Err(ServiceError::NotFound) => Ok(None),
            Err(err) => Err(anyhow!(err)),
        }
    }

    /// Delete one session; unknown tokens are not an error.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn invalidate_session(&self, raw: &str) -> Result<()> {
        if !token::looks_like_token(raw) {
            return Ok(());
        }
        self.store.delete(&token::hash_token(raw)).await
    }

    /// Delete every session of the user (password change, reset).
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn invalidate_all_sessions_for_user(&self, user_id: Uuid) -> Result<u64> {
        let removed = self.store.delete_all_for_user(user_id).await?;
        debug!(%user_id, removed, "sessions invalidated");
        Ok(removed)
    }
}

/// Raw session token from the request cookie, if any.
pub(crate) fn session_token(headers: &HeaderMap) -> Option<String> {
    read_cookie(headers, SESSION_COOKIE_NAME).filter(|token| !token.is_empty())
}

/// Build a secure `HttpOnly` cookie for the session token.
pub(crate) fn session_cookie(
    config: &AuthConfig,
    token: &str,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let ttl_seconds = config.session_ttl_seconds();
    let mut cookie = format!(
        "{SESSION_COOKIE_NAME}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={ttl_seconds}"
    );
    if config.cookie_secure() {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

pub(crate) fn clear_session_cookie(config: &AuthConfig) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!("{SESSION_COOKIE_NAME}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0");
    if config.cookie_secure() {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}
