//! Outbound email: delivery abstraction and the fire-and-forget mailer.
//!
//! Handlers never wait for delivery. `Mailer` spawns one task per message
//! with its own timeout, so a slow or failing provider cannot change the
//! HTTP response. Delivery is at-most-once: failures are logged, not retried.
//!
//! The default sender for local dev is `LogEmailSender`, which logs the link
//! instead of sending real email. `HttpEmailSender` posts JSON to a provider
//! API.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{Instrument, error, info, info_span};

use super::handlers::auth::utils::{build_reset_url, build_verify_url};

const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_FROM: &str = "Clientele <no-reply@clientele.dev>";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmailTemplate {
    VerifyEmail,
    PasswordReset,
}

impl EmailTemplate {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::VerifyEmail => "verify_email",
            Self::PasswordReset => "password_reset",
        }
    }
}

#[derive(Clone, Debug)]
pub struct EmailMessage {
    pub from: String,
    pub to_email: String,
    pub template: EmailTemplate,
    pub subject: String,
    pub body: String,
    pub action_url: String,
}

/// Email delivery abstraction used by the mailer.
#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Deliver a message or return an error; the mailer only logs failures.
    async fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Local dev sender that logs the message instead of sending real email.
#[derive(Clone, Debug)]
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(
            to_email = %message.to_email,
            template = message.template.as_str(),
            action_url = %message.action_url,
            "email send stub"
        );
        Ok(())
    }
}

/// Keeps every message in memory; handy for demos and tests.
#[derive(Debug, Default)]
pub struct MemoryEmailSender {
    sent: Mutex<Vec<EmailMessage>>,
}

impl MemoryEmailSender {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self) -> Vec<EmailMessage> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl EmailSender for MemoryEmailSender {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        self.sent.lock().await.push(message.clone());
        Ok(())
    }
}

#[derive(Serialize)]
struct ApiPayload<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    text: &'a str,
    tags: [&'a str; 1],
}

/// Posts messages as JSON to a transactional email API with a bearer key.
pub struct HttpEmailSender {
    client: reqwest::Client,
    endpoint: url::Url,
    api_key: SecretString,
}

impl HttpEmailSender {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(endpoint: url::Url, api_key: SecretString, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(timeout)
            .build()
            .context("failed to build email HTTP client")?;
        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }
}

#[async_trait]
impl EmailSender for HttpEmailSender {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        let payload = ApiPayload {
            from: &message.from,
            to: &message.to_email,
            subject: &message.subject,
            text: &message.body,
            tags: [message.template.as_str()],
        };
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(self.api_key.expose_secret())
            .json(&payload)
            .send()
            .await
            .context("email API request failed")?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(anyhow!("email API returned {status}"))
        }
    }
}

#[derive(Clone, Debug)]
pub struct MailerConfig {
    base_url: String,
    from: String,
    timeout: Duration,
}

impl MailerConfig {
    #[must_use]
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            from: DEFAULT_FROM.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECONDS),
        }
    }

    #[must_use]
    pub fn with_from(mut self, from: String) -> Self {
        self.from = from;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn from_address(&self) -> &str {
        &self.from
    }
}

#[derive(Clone)]
pub struct Mailer {
    sender: Arc<dyn EmailSender>,
    config: MailerConfig,
}

impl Mailer {
    pub fn new(sender: Arc<dyn EmailSender>, config: MailerConfig) -> Self {
        Self { sender, config }
    }

    /// Queue a verification email. The returned handle is only for tests;
    /// callers normally drop it.
    pub fn send_verification_email(&self, to_email: &str, name: &str, token: &str) -> JoinHandle<()> {
        let action_url = build_verify_url(&self.config.base_url, token);
        let body = format!(
            "Hi {name},\n\nConfirm your email address to finish setting up your account:\n\n{action_url}\n\nIf you did not sign up, you can ignore this message."
        );
        self.dispatch(EmailMessage {
            from: self.config.from.clone(),
            to_email: to_email.to_string(),
            template: EmailTemplate::VerifyEmail,
            subject: "Confirm your email address".to_string(),
            body,
            action_url,
        })
    }

    /// Queue a password reset email.
    pub fn send_password_reset_email(
        &self,
        to_email: &str,
        name: &str,
        token: &str,
    ) -> JoinHandle<()> {
        let action_url = build_reset_url(&self.config.base_url, token);
        let body = format!(
            "Hi {name},\n\nSomeone asked to reset the password for your account. Use this link to choose a new one:\n\n{action_url}\n\nIf it was not you, no action is needed."
        );
        self.dispatch(EmailMessage {
            from: self.config.from.clone(),
            to_email: to_email.to_string(),
            template: EmailTemplate::PasswordReset,
            subject: "Reset your password".to_string(),
            body,
            action_url,
        })
    }

    fn dispatch(&self, message: EmailMessage) -> JoinHandle<()> {
        let sender = self.sender.clone();
        let timeout = self.config.timeout;
        let span = info_span!(
            "email.send",
            template = message.template.as_str(),
            to_email = %message.to_email
        );
        tokio::spawn(
            async move {
                match tokio::time::timeout(timeout, sender.send(&message)).await {
                    Ok(Ok(())) => info!("email delivered"),
                    Ok(Err(err)) => error!("email delivery failed: {err:#}"),
                    Err(_) => error!(timeout_ms = timeout.as_millis(), "email delivery timed out"),
                }
            }
            .instrument(span),
        )
    }
}
