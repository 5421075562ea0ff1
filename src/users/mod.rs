//! User service consumed by the auth core.
//!
//! The core never touches password material or verification token rows
//! directly: it asks a [`UserService`] to authenticate, to issue and consume
//! single-use tokens, and to mutate the profile. Two implementations ship with
//! the crate: [`postgres::PgUserService`] for deployments and
//! [`memory::MemoryUserService`] for local development without a database.
//!
//! Every method returns a typed [`ServiceError`] so handlers can decide what a
//! visitor is allowed to learn (field error, generic message, or nothing).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use uuid::Uuid;

pub mod hashing;
pub mod memory;
pub mod postgres;

const DEFAULT_EMAIL_TOKEN_TTL_SECONDS: i64 = 24 * 60 * 60;
const DEFAULT_RESET_TOKEN_TTL_SECONDS: i64 = 60 * 60;
const DEFAULT_RESEND_COOLDOWN_SECONDS: i64 = 60;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub email_verified: bool,
    pub created_at: DateTime<Utc>,
}

pub struct NewUser {
    pub name: String,
    pub email: String,
    pub password: SecretString,
}

impl std::fmt::Debug for NewUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewUser")
            .field("name", &self.name)
            .field("email", &self.email)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct ProfileUpdate {
    pub name: String,
    pub email: String,
}

/// Result of a profile update; a changed email resets verification.
#[derive(Clone, Debug)]
pub struct ProfileChange {
    pub user: User,
    pub email_changed: bool,
}

/// A freshly issued single-use token together with the user it belongs to,
/// so the caller can address the email.
#[derive(Clone)]
pub struct IssuedForUser {
    pub user: User,
    pub token: String,
}

impl std::fmt::Debug for IssuedForUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedForUser")
            .field("user", &self.user)
            .field("token", &"***")
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified,
    AlreadyVerified,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("resource not found")]
    NotFound,
    #[error("conflict on field `{field}`")]
    Conflict { field: &'static str },
    #[error("invalid field `{field}`: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
    #[error("unauthorized")]
    Unauthorized,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Lifetimes applied by the user service when it issues single-use tokens.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TokenPolicy {
    pub email_verification_ttl_seconds: i64,
    pub password_reset_ttl_seconds: i64,
    pub resend_cooldown_seconds: i64,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            email_verification_ttl_seconds: DEFAULT_EMAIL_TOKEN_TTL_SECONDS,
            password_reset_ttl_seconds: DEFAULT_RESET_TOKEN_TTL_SECONDS,
            resend_cooldown_seconds: DEFAULT_RESEND_COOLDOWN_SECONDS,
        }
    }
}

#[async_trait]
pub trait UserService: Send + Sync {
    /// Create an account. Duplicate emails return `Conflict { field: "email" }`.
    async fn register(&self, new_user: NewUser) -> ServiceResult<User>;

    /// Check credentials. Unknown emails and wrong passwords both return
    /// `Unauthorized` after the same amount of hashing work.
    async fn login(&self, email: &str, password: &SecretString) -> ServiceResult<User>;

    async fn get_by_id(&self, user_id: Uuid) -> ServiceResult<User>;

    /// Issue a new verification token for the user and return the raw value.
    async fn create_email_verification_token(&self, user_id: Uuid) -> ServiceResult<String>;

    /// Consume a verification token. Unknown, expired, or consumed tokens for
    /// unverified users return `NotFound`.
    async fn verify_email(&self, token: &str) -> ServiceResult<VerifyOutcome>;

    /// Issue a verification token for an unverified account, honouring the
    /// resend cooldown. `None` when nothing was issued, for whatever reason.
    async fn resend_verification_email(&self, email: &str) -> ServiceResult<Option<IssuedForUser>>;

    /// `None` when no account matches the email.
    async fn create_password_reset_token(&self, email: &str)
    -> ServiceResult<Option<IssuedForUser>>;

    /// Check a reset token without consuming it.
    async fn validate_password_reset_token(&self, token: &str) -> ServiceResult<User>;

    /// Consume the reset token and store the new password atomically.
    async fn reset_password(&self, token: &str, new_password: &SecretString)
    -> ServiceResult<User>;

    /// Wrong current password returns `Unauthorized`.
    async fn change_password(
        &self,
        user_id: Uuid,
        current_password: &SecretString,
        new_password: &SecretString,
    ) -> ServiceResult<()>;

    async fn update_profile(
        &self,
        user_id: Uuid,
        update: ProfileUpdate,
    ) -> ServiceResult<ProfileChange>;

    /// Remove expired and consumed tokens; returns how many rows went away.
    async fn purge_expired_tokens(&self) -> anyhow::Result<u64>;
}
