//! In-process user service for local development without a database.
//!
//! All state lives behind one async mutex, which gives every token operation
//! the same single-winner semantics as the row-level `UPDATE … RETURNING`
//! statements in the Postgres store. Password hashing runs outside the lock.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use secrecy::SecretString;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{
    IssuedForUser, NewUser, ProfileChange, ProfileUpdate, ServiceError, ServiceResult,
    TokenPolicy, User, UserService, VerifyOutcome, hashing::PasswordHashing,
};
use crate::api::handlers::auth::token::{self, TokenKind};

struct StoredUser {
    user: User,
    password_hash: String,
}

struct StoredToken {
    user_id: Uuid,
    kind: TokenKind,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    consumed_at: Option<DateTime<Utc>>,
}

impl StoredToken {
    fn usable(&self, now: DateTime<Utc>) -> bool {
        self.consumed_at.is_none() && self.expires_at > now
    }
}

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, StoredUser>,
    by_email: HashMap<String, Uuid>,
    tokens: HashMap<Vec<u8>, StoredToken>,
}

impl Inner {
    fn issue(&mut self, user_id: Uuid, kind: TokenKind, ttl_seconds: i64) -> ServiceResult<String> {
        let issued = token::issue(kind)?;
        let now = Utc::now();
        self.tokens.insert(
            issued.hash,
            StoredToken {
                user_id,
                kind,
                created_at: now,
                expires_at: now + Duration::seconds(ttl_seconds),
                consumed_at: None,
            },
        );
        Ok(issued.raw)
    }

    /// Mark every outstanding token of a kind for the user as consumed.
    fn consume_all(&mut self, user_id: Uuid, kind: TokenKind, now: DateTime<Utc>) {
        for stored in self.tokens.values_mut() {
            if stored.user_id == user_id && stored.kind == kind {
                stored.consumed_at.get_or_insert(now);
            }
        }
    }

    fn user_by_email(&self, email: &str) -> Option<&StoredUser> {
        self.by_email.get(email).and_then(|id| self.users.get(id))
    }
}

pub struct MemoryUserService {
    inner: Mutex<Inner>,
    policy: TokenPolicy,
    hashing: PasswordHashing,
}

impl MemoryUserService {
    #[must_use]
    pub fn new(policy: TokenPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            policy,
            hashing: PasswordHashing::default(),
        }
    }

    #[must_use]
    pub fn with_hashing(mut self, hashing: PasswordHashing) -> Self {
        self.hashing = hashing;
        self
    }

    /// Mark an account verified without a token (fixtures and admin tooling).
    ///
    /// # Errors
    /// Returns `NotFound` if the user does not exist.
    pub async fn mark_verified(&self, user_id: Uuid) -> ServiceResult<()> {
        let mut inner = self.inner.lock().await;
        let stored = inner.users.get_mut(&user_id).ok_or(ServiceError::NotFound)?;
        stored.user.email_verified = true;
        Ok(())
    }

    /// Number of live (unconsumed, unexpired) tokens of a kind for a user.
    pub async fn live_tokens(&self, user_id: Uuid, kind: TokenKind) -> usize {
        let now = Utc::now();
        let inner = self.inner.lock().await;
        inner
            .tokens
            .values()
            .filter(|stored| stored.user_id == user_id && stored.kind == kind && stored.usable(now))
            .count()
    }

    /// Expire every token immediately; lets callers exercise expiry paths.
    pub async fn expire_all_tokens(&self) {
        let past = Utc::now() - Duration::seconds(1);
        let mut inner = self.inner.lock().await;
        for stored in inner.tokens.values_mut() {
            stored.expires_at = past;
        }
    }
}

#[async_trait]
impl UserService for MemoryUserService {
    async fn register(&self, new_user: NewUser) -> ServiceResult<User> {
        if self.inner.lock().await.by_email.contains_key(&new_user.email) {
            return Err(ServiceError::Conflict { field: "email" });
        }
        let password_hash = self.hashing.hash(&new_user.password).await?;

        let mut inner = self.inner.lock().await;
        // Re-check under the lock; another registration may have won meanwhile.
        if inner.by_email.contains_key(&new_user.email) {
            return Err(ServiceError::Conflict { field: "email" });
        }
        let user = User {
            id: Uuid::now_v7(),
            name: new_user.name,
            email: new_user.email,
            email_verified: false,
            created_at: Utc::now(),
        };
        inner.by_email.insert(user.email.clone(), user.id);
        inner.users.insert(
            user.id,
            StoredUser {
                user: user.clone(),
                password_hash,
            },
        );
        debug!(user_id = %user.id, "registered user");
        Ok(user)
    }

    async fn login(&self, email: &str, password: &SecretString) -> ServiceResult<User> {
        let candidate = {
            let inner = self.inner.lock().await;
            inner
                .user_by_email(email)
                .map(|stored| (stored.user.clone(), stored.password_hash.clone()))
        };
        let (user, stored_hash) = match candidate {
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
        let inner = self.inner.lock().await;
        inner
            .users
            .get(&user_id)
            .map(|stored| stored.user.clone())
            .ok_or(ServiceError::NotFound)
    }

    async fn create_email_verification_token(&self, user_id: Uuid) -> ServiceResult<String> {
        let mut inner = self.inner.lock().await;
        if !inner.users.contains_key(&user_id) {
            return Err(ServiceError::NotFound);
        }
        inner.issue(
            user_id,
            TokenKind::EmailVerification,
            self.policy.email_verification_ttl_seconds,
        )
    }

    async fn verify_email(&self, raw: &str) -> ServiceResult<VerifyOutcome> {
        let hash = token::hash_token(raw);
        let now = Utc::now();
        let mut inner = self.inner.lock().await;

        let (user_id, usable) = match inner.tokens.get(&hash) {
            Some(stored) if stored.kind == TokenKind::EmailVerification => {
                (stored.user_id, stored.usable(now))
            }
            _ => return Err(ServiceError::NotFound),
        };
        let already_verified = inner
            .users
            .get(&user_id)
            .map(|stored| stored.user.email_verified)
            .ok_or(ServiceError::NotFound)?;

        if !usable {
            // A consumed link for a verified account degrades to "already verified".
            return if already_verified {
                Ok(VerifyOutcome::AlreadyVerified)
            } else {
                Err(ServiceError::NotFound)
            };
        }

        // Sibling links die with this one; they were sent to the same address.
        inner.consume_all(user_id, TokenKind::EmailVerification, now);
        if already_verified {
            return Ok(VerifyOutcome::AlreadyVerified);
        }
        if let Some(stored) = inner.users.get_mut(&user_id) {
            stored.user.email_verified = true;
        }
        Ok(VerifyOutcome::Verified)
    }

    async fn resend_verification_email(&self, email: &str) -> ServiceResult<Option<IssuedForUser>> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let Some(user) = inner.user_by_email(email).map(|stored| stored.user.clone()) else {
            return Ok(None);
        };
        if user.email_verified {
            return Ok(None);
        }
        let cooldown_start = now - Duration::seconds(self.policy.resend_cooldown_seconds);
        let cooling_down = inner.tokens.values().any(|stored| {
            stored.user_id == user.id
                && stored.kind == TokenKind::EmailVerification
                && stored.created_at > cooldown_start
        });
        if cooling_down {
            return Ok(None);
        }
        let token = inner.issue(
            user.id,
            TokenKind::EmailVerification,
            self.policy.email_verification_ttl_seconds,
        )?;
        Ok(Some(IssuedForUser { user, token }))
    }

    async fn create_password_reset_token(
        &self,
        email: &str,
    ) -> ServiceResult<Option<IssuedForUser>> {
        let mut inner = self.inner.lock().await;
        let Some(user) = inner.user_by_email(email).map(|stored| stored.user.clone()) else {
            return Ok(None);
        };
        let token = inner.issue(
            user.id,
            TokenKind::PasswordReset,
            self.policy.password_reset_ttl_seconds,
        )?;
        Ok(Some(IssuedForUser { user, token }))
    }

    async fn validate_password_reset_token(&self, raw: &str) -> ServiceResult<User> {
        let hash = token::hash_token(raw);
        let now = Utc::now();
        let inner = self.inner.lock().await;
        let user_id = inner
            .tokens
            .get(&hash)
            .filter(|stored| stored.kind == TokenKind::PasswordReset && stored.usable(now))
            .map(|stored| stored.user_id)
            .ok_or(ServiceError::NotFound)?;
        inner
            .users
            .get(&user_id)
            .map(|stored| stored.user.clone())
            .ok_or(ServiceError::NotFound)
    }

    async fn reset_password(
        &self,
        raw: &str,
        new_password: &SecretString,
    ) -> ServiceResult<User> {
        // Fail fast before paying for the hash; the consume below is authoritative.
        self.validate_password_reset_token(raw).await?;
        let password_hash = self.hashing.hash(new_password).await?;

        let hash = token::hash_token(raw);
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let user_id = match inner.tokens.get_mut(&hash) {
            Some(stored) if stored.kind == TokenKind::PasswordReset && stored.usable(now) => {
                stored.consumed_at = Some(now);
                stored.user_id
            }
            _ => return Err(ServiceError::NotFound),
        };
        // Any other outstanding reset links for this user die with this one.
        inner.consume_all(user_id, TokenKind::PasswordReset, now);
        let stored = inner.users.get_mut(&user_id).ok_or(ServiceError::NotFound)?;
        stored.password_hash = password_hash;
        Ok(stored.user.clone())
    }

    async fn change_password(
        &self,
        user_id: Uuid,
        current_password: &SecretString,
        new_password: &SecretString,
    ) -> ServiceResult<()> {
        let current_hash = {
            let inner = self.inner.lock().await;
            inner
                .users
                .get(&user_id)
                .map(|stored| stored.password_hash.clone())
                .ok_or(ServiceError::NotFound)?
        };
        if !self
            .hashing
            .verify(current_password, Some(current_hash))
            .await?
        {
            return Err(ServiceError::Unauthorized);
        }
        let password_hash = self.hashing.hash(new_password).await?;
        let mut inner = self.inner.lock().await;
        let stored = inner.users.get_mut(&user_id).ok_or(ServiceError::NotFound)?;
        stored.password_hash = password_hash;
        Ok(())
    }

    async fn update_profile(
        &self,
        user_id: Uuid,
        update: ProfileUpdate,
    ) -> ServiceResult<ProfileChange> {
        let mut inner = self.inner.lock().await;
        let current_email = inner
            .users
            .get(&user_id)
            .map(|stored| stored.user.email.clone())
            .ok_or(ServiceError::NotFound)?;
        let email_changed = current_email != update.email;
        if email_changed && inner.by_email.contains_key(&update.email) {
            return Err(ServiceError::Conflict { field: "email" });
        }
        if email_changed {
            inner.by_email.remove(&current_email);
            inner.by_email.insert(update.email.clone(), user_id);
            // Links sent to the old address must not verify the new one.
            inner.consume_all(user_id, TokenKind::EmailVerification, Utc::now());
        }
        let stored = inner.users.get_mut(&user_id).ok_or(ServiceError::NotFound)?;
        stored.user.name = update.name;
        if email_changed {
            stored.user.email = update.email;
            stored.user.email_verified = false;
        }
        Ok(ProfileChange {
            user: stored.user.clone(),
            email_changed,
        })
    }

    async fn purge_expired_tokens(&self) -> anyhow::Result<u64> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let before = inner.tokens.len();
        inner.tokens.retain(|_, stored| stored.usable(now));
        Ok(u64::try_from(before - inner.tokens.len()).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Result, anyhow};

    fn service() -> Result<MemoryUserService> {
        Ok(MemoryUserService::new(TokenPolicy::default())
            .with_hashing(PasswordHashing::with_params(1024, 1, 1)?))
    }

    async fn register(service: &MemoryUserService, email: &str) -> Result<User> {
        Ok(service
            .register(NewUser {
                name: "Ada".to_string(),
                email: email.to_string(),
                password: SecretString::from("password1"),
            })
            .await?)
    }

    #[tokio::test]
    async fn duplicate_email_is_a_conflict() -> Result<()> {
        let service = service()?;
        register(&service, "a@b.com").await?;
        let err = register(&service, "a@b.com").await.err();
        assert!(matches!(
            err.and_then(|err| err.downcast::<ServiceError>().ok()),
            Some(ServiceError::Conflict { field: "email" })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn login_failures_are_uniform() -> Result<()> {
        let service = service()?;
        register(&service, "a@b.com").await?;
        let wrong = service
            .login("a@b.com", &SecretString::from("nope-nope"))
            .await;
        let unknown = service
            .login("x@b.com", &SecretString::from("password1"))
            .await;
        assert!(matches!(wrong, Err(ServiceError::Unauthorized)));
        assert!(matches!(unknown, Err(ServiceError::Unauthorized)));
        let user = service
            .login("a@b.com", &SecretString::from("password1"))
            .await?;
        assert_eq!(user.email, "a@b.com");
        Ok(())
    }

    #[tokio::test]
    async fn verification_token_is_single_use() -> Result<()> {
        let service = service()?;
        let user = register(&service, "a@b.com").await?;
        let token = service.create_email_verification_token(user.id).await?;

        assert_eq!(service.verify_email(&token).await?, VerifyOutcome::Verified);
        assert_eq!(
            service.verify_email(&token).await?,
            VerifyOutcome::AlreadyVerified
        );
        assert!(service.get_by_id(user.id).await?.email_verified);
        Ok(())
    }

    #[tokio::test]
    async fn expired_verification_token_is_rejected() -> Result<()> {
        let service = service()?;
        let user = register(&service, "a@b.com").await?;
        let token = service.create_email_verification_token(user.id).await?;
        service.expire_all_tokens().await;
        assert!(matches!(
            service.verify_email(&token).await,
            Err(ServiceError::NotFound)
        ));
        assert!(!service.get_by_id(user.id).await?.email_verified);
        Ok(())
    }

    #[tokio::test]
    async fn reset_token_cannot_be_replayed() -> Result<()> {
        let service = service()?;
        register(&service, "a@b.com").await?;
        let issued = service
            .create_password_reset_token("a@b.com")
            .await?
            .ok_or_else(|| anyhow!("expected a token"))?;
        let new_password = SecretString::from("new-password");

        service.validate_password_reset_token(&issued.token).await?;
        service.reset_password(&issued.token, &new_password).await?;
        assert!(matches!(
            service.reset_password(&issued.token, &new_password).await,
            Err(ServiceError::NotFound)
        ));
        service.login("a@b.com", &new_password).await?;
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_verifications_have_one_winner() -> Result<()> {
        let service = std::sync::Arc::new(service()?);
        let user = register(&service, "a@b.com").await?;
        let token = service.create_email_verification_token(user.id).await?;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = service.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move { service.verify_email(&token).await }));
        }
        let mut verified = 0;
        for handle in handles {
            if handle.await?? == VerifyOutcome::Verified {
                verified += 1;
            }
        }
        assert_eq!(verified, 1);
        Ok(())
    }

    #[tokio::test]
    async fn resend_respects_cooldown_and_verified_state() -> Result<()> {
        let service = service()?;
        let user = register(&service, "a@b.com").await?;
        assert!(service.resend_verification_email("a@b.com").await?.is_some());
        assert!(service.resend_verification_email("a@b.com").await?.is_none());
        assert!(service.resend_verification_email("nobody@b.com").await?.is_none());

        service.mark_verified(user.id).await?;
        service.expire_all_tokens().await;
        assert!(service.purge_expired_tokens().await? >= 1);
        assert!(service.resend_verification_email("a@b.com").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn email_change_resets_verification() -> Result<()> {
        let service = service()?;
        let user = register(&service, "a@b.com").await?;
        register(&service, "taken@b.com").await?;
        service.mark_verified(user.id).await?;

        let conflict = service
            .update_profile(
                user.id,
                ProfileUpdate {
                    name: "Ada".to_string(),
                    email: "taken@b.com".to_string(),
                },
            )
            .await;
        assert!(matches!(conflict, Err(ServiceError::Conflict { .. })));

        let change = service
            .update_profile(
                user.id,
                ProfileUpdate {
                    name: "Ada L".to_string(),
                    email: "ada@b.com".to_string(),
                },
            )
            .await?;
        assert!(change.email_changed);
        assert!(!change.user.email_verified);
        assert_eq!(change.user.name, "Ada L");
        Ok(())
    }

    #[tokio::test]
    async fn old_verification_links_die_with_an_email_change() -> Result<()> {
        let service = service()?;
        let user = register(&service, "a@b.com").await?;
        let first = service.create_email_verification_token(user.id).await?;
        let second = service.create_email_verification_token(user.id).await?;

        assert_eq!(service.verify_email(&first).await?, VerifyOutcome::Verified);
        service
            .update_profile(
                user.id,
                ProfileUpdate {
                    name: "Ada".to_string(),
                    email: "new@b.com".to_string(),
                },
            )
            .await?;

        assert!(matches!(
            service.verify_email(&second).await,
            Err(ServiceError::NotFound)
        ));
        assert!(!service.get_by_id(user.id).await?.email_verified);
        Ok(())
    }

    #[tokio::test]
    async fn pending_link_is_revoked_by_an_email_change() -> Result<()> {
        let service = service()?;
        let user = register(&service, "a@b.com").await?;
        let pending = service.create_email_verification_token(user.id).await?;
        service
            .update_profile(
                user.id,
                ProfileUpdate {
                    name: "Ada".to_string(),
                    email: "new@b.com".to_string(),
                },
            )
            .await?;

        assert!(matches!(
            service.verify_email(&pending).await,
            Err(ServiceError::NotFound)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn change_password_checks_current_password() -> Result<()> {
        let service = service()?;
        let user = register(&service, "a@b.com").await?;
        let wrong = service
            .change_password(
                user.id,
                &SecretString::from("not-it"),
                &SecretString::from("password2"),
            )
            .await;
        assert!(matches!(wrong, Err(ServiceError::Unauthorized)));
        service
            .change_password(
                user.id,
                &SecretString::from("password1"),
                &SecretString::from("password2"),
            )
            .await?;
        service
            .login("a@b.com", &SecretString::from("password2"))
            .await?;
        Ok(())
    }
}
