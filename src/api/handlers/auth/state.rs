//! Auth state and configuration.
//!
//! Cookie names, lifetimes and landing paths are defined here once and shared
//! by the middleware chain and the flow handlers.

use std::sync::Arc;

use super::session::Sessions;
use super::token::TokenKind;
use crate::api::email::Mailer;
use crate::users::{TokenPolicy, UserService};

pub const SESSION_COOKIE_NAME: &str = "clientele_session";
pub const CSRF_COOKIE_NAME: &str = "clientele_csrf";
pub const CSRF_FORM_FIELD: &str = "csrf_token";
pub const CSRF_HEADER: &str = "x-csrf-token";

pub const LOGIN_PATH: &str = "/login";
pub const VERIFY_REMINDER_PATH: &str = "/verify-email-reminder";
pub const DEFAULT_LANDING_PATH: &str = "/dashboard";

const DEFAULT_SESSION_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;
const DEFAULT_EMAIL_TOKEN_TTL_SECONDS: i64 = 24 * 60 * 60;
const DEFAULT_RESET_TOKEN_TTL_SECONDS: i64 = 60 * 60;
const DEFAULT_CSRF_TTL_SECONDS: i64 = 60 * 60;
const DEFAULT_RESEND_COOLDOWN_SECONDS: i64 = 60;

/// Upper bound for every configured lifetime: ten years.
pub const MAX_TTL_SECONDS: i64 = 10 * 365 * 24 * 60 * 60;

/// Deployment mode; production turns on the `Secure` cookie attribute.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeploymentMode {
    Production,
    #[default]
    Development,
}

impl DeploymentMode {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Some(Self::Production),
            "development" | "dev" => Some(Self::Development),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Development => "development",
        }
    }
}

#[derive(Clone, Debug)]
pub struct AuthConfig {
    base_url: String,
    mode: DeploymentMode,
    session_ttl_seconds: i64,
    email_token_ttl_seconds: i64,
    reset_token_ttl_seconds: i64,
    csrf_ttl_seconds: i64,
    resend_cooldown_seconds: i64,
    invite_code: Option<String>,
}

impl AuthConfig {
    #[must_use]
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            mode: DeploymentMode::default(),
            session_ttl_seconds: DEFAULT_SESSION_TTL_SECONDS,
            email_token_ttl_seconds: DEFAULT_EMAIL_TOKEN_TTL_SECONDS,
            reset_token_ttl_seconds: DEFAULT_RESET_TOKEN_TTL_SECONDS,
            csrf_ttl_seconds: DEFAULT_CSRF_TTL_SECONDS,
            resend_cooldown_seconds: DEFAULT_RESEND_COOLDOWN_SECONDS,
            invite_code: None,
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: DeploymentMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_session_ttl_seconds(mut self, seconds: i64) -> Self {
        self.session_ttl_seconds = seconds.clamp(1, MAX_TTL_SECONDS);
        self
    }

    #[must_use]
    pub fn with_email_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.email_token_ttl_seconds = seconds.clamp(1, MAX_TTL_SECONDS);
        self
    }

    #[must_use]
    pub fn with_reset_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.reset_token_ttl_seconds = seconds.clamp(1, MAX_TTL_SECONDS);
        self
    }

    #[must_use]
    pub fn with_csrf_ttl_seconds(mut self, seconds: i64) -> Self {
        self.csrf_ttl_seconds = seconds.clamp(1, MAX_TTL_SECONDS);
        self
    }

    #[must_use]
    pub fn with_resend_cooldown_seconds(mut self, seconds: i64) -> Self {
        self.resend_cooldown_seconds = seconds.clamp(0, MAX_TTL_SECONDS);
        self
    }

    /// Require this code on registration. Empty strings disable the check.
    #[must_use]
    pub fn with_invite_code(mut self, code: Option<String>) -> Self {
        self.invite_code = code.filter(|code| !code.trim().is_empty());
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn mode(&self) -> DeploymentMode {
        self.mode
    }

    #[must_use]
    pub fn session_ttl_seconds(&self) -> i64 {
        self.session_ttl_seconds
    }

    #[must_use]
    pub fn csrf_ttl_seconds(&self) -> i64 {
        self.csrf_ttl_seconds
    }

    #[must_use]
    pub fn invite_code(&self) -> Option<&str> {
        self.invite_code.as_deref()
    }

    /// Lifetime of a token of the given kind.
    #[must_use]
    pub fn ttl(&self, kind: TokenKind) -> i64 {
        match kind {
            TokenKind::Session => self.session_ttl_seconds,
            TokenKind::EmailVerification => self.email_token_ttl_seconds,
            TokenKind::PasswordReset => self.reset_token_ttl_seconds,
        }
    }

    /// Token lifetimes handed to the user service.
    #[must_use]
    pub fn token_policy(&self) -> TokenPolicy {
        TokenPolicy {
            email_verification_ttl_seconds: self.email_token_ttl_seconds,
            password_reset_ttl_seconds: self.reset_token_ttl_seconds,
            resend_cooldown_seconds: self.resend_cooldown_seconds,
        }
    }

    pub(crate) fn cookie_secure(&self) -> bool {
        self.mode == DeploymentMode::Production
    }
}

#[derive(Clone)]
pub struct AuthState {
    config: Arc<AuthConfig>,
    sessions: Sessions,
    users: Arc<dyn UserService>,
    mailer: Mailer,
}

impl AuthState {
    pub fn new(
        config: AuthConfig,
        sessions: Sessions,
        users: Arc<dyn UserService>,
        mailer: Mailer,
    ) -> Self {
        Self {
            config: Arc::new(config),
            sessions,
            users,
            mailer,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    #[must_use]
    pub fn sessions(&self) -> &Sessions {
        &self.sessions
    }

    #[must_use]
    pub fn users(&self) -> &dyn UserService {
        self.users.as_ref()
    }

    #[must_use]
    pub fn mailer(&self) -> &Mailer {
        &self.mailer
    }
}
