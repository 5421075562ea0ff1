//! Postgres-backed user service.
//!
//! Accounts live in `users`; verification and reset tokens share the
//! `verification_tokens` table, keyed by SHA-256 hash and tagged with a
//! `purpose`. Single-use semantics come from `UPDATE … WHERE consumed_at IS
//! NULL … RETURNING`, so concurrent consumers race on the row and exactly one
//! wins.

use anyhow::{Context, Result};
use async_trait::async_trait;
use secrecy::SecretString;
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use tracing::{Instrument, debug};
use uuid::Uuid;

use super::{
    IssuedForUser, NewUser, ProfileChange, ProfileUpdate, ServiceError, ServiceResult,
    TokenPolicy, User, UserService, VerifyOutcome, hashing::PasswordHashing,
};
use crate::api::handlers::auth::{
    token::{self, TokenKind},
    utils::is_unique_violation,
};

const USER_COLUMNS: &str = "id, name, email, email_verified_at IS NOT NULL AS email_verified, created_at";

pub struct PgUserService {
    pool: PgPool,
    policy: TokenPolicy,
    hashing: PasswordHashing,
}

impl PgUserService {
    #[must_use]
    pub fn new(pool: PgPool, policy: TokenPolicy) -> Self {
        Self {
            pool,
            policy,
            hashing: PasswordHashing::default(),
        }
    }

    #[must_use]
    pub fn with_hashing(mut self, hashing: PasswordHashing) -> Self {
        self.hashing = hashing;
        self
    }

    async fn password_hash_by_email(&self, email: &str) -> Result<Option<(User, String)>> {
        let query = format!("SELECT {USER_COLUMNS}, password_hash FROM users WHERE email = $1");
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(email)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup user by email")?;
        Ok(row.map(|row| (user_from_row(&row), row.get("password_hash"))))
    }

    async fn password_hash_by_id(&self, user_id: Uuid) -> Result<Option<String>> {
        let query = "SELECT password_hash FROM users WHERE id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup password hash")?;
        Ok(row.map(|row| row.get("password_hash")))
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(self
            .password_hash_by_email(email)
            .await?
            .map(|(user, _)| user))
    }
}

fn user_from_row(row: &PgRow) -> User {
    User {
        id: row.get("id"),
        name: row.get("name"),
        email: row.get("email"),
        email_verified: row.get("email_verified"),
        created_at: row.get("created_at"),
    }
}

async fn insert_token(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    kind: TokenKind,
    ttl_seconds: i64,
) -> Result<String> {
    // Only the hash is stored; the raw value goes into the email link.
    let issued = token::issue(kind)?;
    let query = r"
        INSERT INTO verification_tokens (user_id, token_hash, purpose, expires_at)
        VALUES ($1, $2, $3, NOW() + ($4 * INTERVAL '1 second'))
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(&issued.hash)
        .bind(kind.as_str())
        .bind(ttl_seconds)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .with_context(|| format!("failed to insert {} token", kind.as_str()))?;
    Ok(issued.raw)
}

async fn consume_token(
    tx: &mut Transaction<'_, Postgres>,
    token_hash: &[u8],
    kind: TokenKind,
) -> Result<Option<Uuid>> {
    let query = r"
        UPDATE verification_tokens
        SET consumed_at = NOW()
        WHERE token_hash = $1
          AND purpose = $2
          AND consumed_at IS NULL
          AND expires_at > NOW()
        RETURNING user_id
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(token_hash)
        .bind(kind.as_str())
        .fetch_optional(&mut **tx)
        .instrument(span)
        .await
        .with_context(|| format!("failed to consume {} token", kind.as_str()))?;
    Ok(row.map(|row| row.get("user_id")))
}

/// Retire every unused token of one purpose for a user.
async fn consume_outstanding(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    kind: TokenKind,
) -> Result<u64> {
    let query = r"
        UPDATE verification_tokens
        SET consumed_at = NOW()
        WHERE user_id = $1 AND purpose = $2 AND consumed_at IS NULL
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(user_id)
        .bind(kind.as_str())
        .execute(&mut **tx)
        .instrument(span)
        .await
        .with_context(|| format!("failed to retire outstanding {} tokens", kind.as_str()))?;
    Ok(result.rows_affected())
}

async fn resend_cooldown_active(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    cooldown_seconds: i64,
) -> Result<bool> {
    let query = r"
        SELECT 1
        FROM verification_tokens
        WHERE user_id = $1
          AND purpose = $2
          AND created_at > NOW() - ($3 * INTERVAL '1 second')
        LIMIT 1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user_id)
        .bind(TokenKind::EmailVerification.as_str())
        .bind(cooldown_seconds)
        .fetch_optional(&mut **tx)
        .instrument(span)
        .await
        .context("failed to check resend cooldown")?;
    Ok(row.is_some())
}

#[async_trait]
impl UserService for PgUserService {
    async fn register(&self, new_user: NewUser) -> ServiceResult<User> {
        let password_hash = self.hashing.hash(&new_user.password).await?;
        let query = format!(
            r"
            INSERT INTO users (name, email, password_hash)
            VALUES ($1, $2, $3)
            RETURNING {USER_COLUMNS}
            "
        );
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(&new_user.name)
            .bind(&new_user.email)
            .bind(password_hash)
            .fetch_one(&self.pool)
            .instrument(span)
            .await;
        match row {
            Ok(row) => {
                let user = user_from_row(&row);
                debug!(user_id = %user.id, "registered user");
                Ok(user)
            }
            Err(err) if is_unique_violation(&err) => Err(ServiceError::Conflict { field: "email" }),
            Err(err) => Err(anyhow::Error::new(err)
                .context("failed to insert user")
                .into()),
        }
    }

    async fn login(&self, email: &str, password: &SecretString) -> ServiceResult<User> {
        let (user, stored_hash) = match self.password_hash_by_email(email).await? {
            Some((user, hash)) => (Some(user), Some(hash)),
            None => (None, None),
        };
        if self.hashing.verify(password, stored_hash).await? {
            user.ok_or(ServiceError::Unauthorized)
        } else {
            Err(ServiceError::Unauthorized)
        }
    }

    async fn get_by_id(&self, user_id: Uuid) -> ServiceResult<User> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup user")?;
        row.map(|row| user_from_row(&row))
            .ok_or(ServiceError::NotFound)
    }

    async fn create_email_verification_token(&self, user_id: Uuid) -> ServiceResult<String> {
        let mut tx = self.pool.begin().await.context("begin token transaction")?;
        let token = match insert_token(
            &mut tx,
            user_id,
            TokenKind::EmailVerification,
            self.policy.email_verification_ttl_seconds,
        )
        .await
        {
            Ok(token) => token,
            Err(err) => {
                // A foreign key violation means the user vanished.
                let missing_user = err
                    .downcast_ref::<sqlx::Error>()
                    .and_then(|err| err.as_database_error())
                    .and_then(|db_err| db_err.code())
                    .is_some_and(|code| code.as_ref() == "23503");
                let _ = tx.rollback().await;
                return Err(if missing_user {
                    ServiceError::NotFound
                } else {
                    err.into()
                });
            }
        };
        tx.commit().await.context("commit token transaction")?;
        Ok(token)
    }

    async fn verify_email(&self, raw: &str) -> ServiceResult<VerifyOutcome> {
        let token_hash = token::hash_token(raw);
        let mut tx = self.pool.begin().await.context("begin verify transaction")?;

        if let Some(user_id) =
            consume_token(&mut tx, &token_hash, TokenKind::EmailVerification).await?
        {
            let query = r"
                UPDATE users
                SET email_verified_at = NOW(), updated_at = NOW()
                WHERE id = $1 AND email_verified_at IS NULL
            ";
            let span = tracing::info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "UPDATE",
                db.statement = query
            );
            let result = sqlx::query(query)
                .bind(user_id)
                .execute(&mut *tx)
                .instrument(span)
                .await
                .context("failed to mark email verified")?;
            consume_outstanding(&mut tx, user_id, TokenKind::EmailVerification).await?;
            tx.commit().await.context("commit verify transaction")?;
            return Ok(if result.rows_affected() == 1 {
                VerifyOutcome::Verified
            } else {
                VerifyOutcome::AlreadyVerified
            });
        }

        // Nothing consumed: a repeated click on a verified account is still a success.
        let query = r"
            SELECT users.email_verified_at IS NOT NULL AS email_verified
            FROM verification_tokens
            JOIN users ON users.id = verification_tokens.user_id
            WHERE verification_tokens.token_hash = $1
              AND verification_tokens.purpose = $2
            LIMIT 1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(&token_hash)
            .bind(TokenKind::EmailVerification.as_str())
            .fetch_optional(&mut *tx)
            .instrument(span)
            .await
            .context("failed to lookup verification token")?;
        tx.commit().await.context("commit verify transaction")?;

        match row {
            Some(row) if row.get::<bool, _>("email_verified") => Ok(VerifyOutcome::AlreadyVerified),
            _ => Err(ServiceError::NotFound),
        }
    }

    async fn resend_verification_email(&self, email: &str) -> ServiceResult<Option<IssuedForUser>> {
        let mut tx = self.pool.begin().await.context("begin resend transaction")?;

        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1 FOR UPDATE");
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(email)
            .fetch_optional(&mut *tx)
            .instrument(span)
            .await
            .context("failed to lookup user for resend")?;

        let Some(user) = row.map(|row| user_from_row(&row)) else {
            tx.commit().await.context("commit resend noop")?;
            return Ok(None);
        };
        if user.email_verified
            || resend_cooldown_active(&mut tx, user.id, self.policy.resend_cooldown_seconds)
                .await?
        {
            tx.commit().await.context("commit resend noop")?;
            return Ok(None);
        }

        let token = insert_token(
            &mut tx,
            user.id,
            TokenKind::EmailVerification,
            self.policy.email_verification_ttl_seconds,
        )
        .await?;
        tx.commit().await.context("commit resend")?;
        Ok(Some(IssuedForUser { user, token }))
    }

    async fn create_password_reset_token(
        &self,
        email: &str,
    ) -> ServiceResult<Option<IssuedForUser>> {
        let Some(user) = self.user_by_email(email).await? else {
            return Ok(None);
        };
        let mut tx = self.pool.begin().await.context("begin reset transaction")?;
        let token = insert_token(
            &mut tx,
            user.id,
            TokenKind::PasswordReset,
            self.policy.password_reset_ttl_seconds,
        )
        .await?;
        tx.commit().await.context("commit reset transaction")?;
        Ok(Some(IssuedForUser { user, token }))
    }

    async fn validate_password_reset_token(&self, raw: &str) -> ServiceResult<User> {
        let query = r"
            SELECT users.id, users.name, users.email,
                   users.email_verified_at IS NOT NULL AS email_verified, users.created_at
            FROM verification_tokens
            JOIN users ON users.id = verification_tokens.user_id
            WHERE verification_tokens.token_hash = $1
              AND verification_tokens.purpose = $2
              AND verification_tokens.consumed_at IS NULL
              AND verification_tokens.expires_at > NOW()
            LIMIT 1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(token::hash_token(raw))
            .bind(TokenKind::PasswordReset.as_str())
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to validate reset token")?;
        row.map(|row| user_from_row(&row))
            .ok_or(ServiceError::NotFound)
    }

    async fn reset_password(
        &self,
        raw: &str,
        new_password: &SecretString,
    ) -> ServiceResult<User> {
        let password_hash = self.hashing.hash(new_password).await?;
        let mut tx = self.pool.begin().await.context("begin reset transaction")?;

        let Some(user_id) =
            consume_token(&mut tx, &token::hash_token(raw), TokenKind::PasswordReset).await?
        else {
            let _ = tx.rollback().await;
            return Err(ServiceError::NotFound);
        };

        consume_outstanding(&mut tx, user_id, TokenKind::PasswordReset).await?;

        let query = format!(
            r"
            UPDATE users
            SET password_hash = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING {USER_COLUMNS}
            "
        );
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(user_id)
            .bind(password_hash)
            .fetch_optional(&mut *tx)
            .instrument(span)
            .await
            .context("failed to store new password")?;
        let Some(row) = row else {
            let _ = tx.rollback().await;
            return Err(ServiceError::NotFound);
        };
        tx.commit().await.context("commit reset transaction")?;
        Ok(user_from_row(&row))
    }

    async fn change_password(
        &self,
        user_id: Uuid,
        current_password: &SecretString,
        new_password: &SecretString,
    ) -> ServiceResult<()> {
        let current_hash = self
            .password_hash_by_id(user_id)
            .await?
            .ok_or(ServiceError::NotFound)?;
        if !self
            .hashing
            .verify(current_password, Some(current_hash))
            .await?
        {
            return Err(ServiceError::Unauthorized);
        }
        let password_hash = self.hashing.hash(new_password).await?;
        let query = "UPDATE users SET password_hash = $2, updated_at = NOW() WHERE id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(password_hash)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to change password")?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::NotFound);
        }
        Ok(())
    }

    async fn update_profile(
        &self,
        user_id: Uuid,
        update: ProfileUpdate,
    ) -> ServiceResult<ProfileChange> {
        let mut tx = self.pool.begin().await.context("begin profile transaction")?;

        let query = "SELECT email FROM users WHERE id = $1 FOR UPDATE";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let current_email: String = sqlx::query(query)
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .instrument(span)
            .await
            .context("failed to lookup profile")?
            .map(|row| row.get("email"))
            .ok_or(ServiceError::NotFound)?;
        let email_changed = current_email != update.email;

        // A new address starts unverified.
        let query = format!(
            r"
            UPDATE users
            SET name = $2,
                email = $3,
                email_verified_at = CASE WHEN $4 THEN NULL ELSE email_verified_at END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {USER_COLUMNS}
            "
        );
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(user_id)
            .bind(&update.name)
            .bind(&update.email)
            .bind(email_changed)
            .fetch_one(&mut *tx)
            .instrument(span)
            .await;
        let user = match row {
            Ok(row) => user_from_row(&row),
            Err(err) if is_unique_violation(&err) => {
                let _ = tx.rollback().await;
                return Err(ServiceError::Conflict { field: "email" });
            }
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context("failed to update profile")
                    .into());
            }
        };
        if email_changed {
            // Links sent to the old address must not verify the new one.
            consume_outstanding(&mut tx, user_id, TokenKind::EmailVerification).await?;
        }
        tx.commit().await.context("commit profile transaction")?;
        Ok(ProfileChange {
            user,
            email_changed,
        })
    }

    async fn purge_expired_tokens(&self) -> Result<u64> {
        let query = r"
            DELETE FROM verification_tokens
            WHERE expires_at <= NOW() OR consumed_at IS NOT NULL
        ";
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
            .context("failed to purge verification tokens")?;
        Ok(result.rows_affected())
    }
}
