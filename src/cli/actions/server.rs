use crate::api::{
    self, ServerOptions,
    email::{EmailSender, HttpEmailSender, LogEmailSender, Mailer, MailerConfig},
    handlers::auth::AuthConfig,
};
use crate::cli::commands::{auth, email};
use crate::cli::telemetry;
use anyhow::{Result, anyhow};
use std::{sync::Arc, time::Duration};
use tracing::info;
use url::Url;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: Option<String>,
    pub auth: auth::Options,
    pub email: email::Options,
}

/// Build the auth and mailer configuration, then run the server.
/// # Errors
/// Returns an error if the email sender cannot be built or the server fails.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let auth_config = auth_config(&args.auth);
    let timeout = Duration::from_secs(args.email.timeout_seconds);
    let mailer_config = MailerConfig::new(auth_config.base_url().to_string())
        .with_from(args.email.from.clone())
        .with_timeout(timeout);
    let mailer = Mailer::new(email_sender(&args.email, timeout)?, mailer_config);

    let options = ServerOptions {
        port: args.port,
        dsn: args.dsn,
        sweep_interval: Duration::from_secs(args.auth.sweep_interval_seconds),
    };

    let result = api::new(options, auth_config, mailer).await;
    telemetry::shutdown_tracer();
    result
}

fn auth_config(options: &auth::Options) -> AuthConfig {
    AuthConfig::new(options.base_url.clone())
        .with_mode(options.mode)
        .with_session_ttl_seconds(options.session_ttl_seconds)
        .with_email_token_ttl_seconds(options.email_token_ttl_seconds)
        .with_reset_token_ttl_seconds(options.reset_token_ttl_seconds)
        .with_csrf_ttl_seconds(options.csrf_ttl_seconds)
        .with_resend_cooldown_seconds(options.resend_cooldown_seconds)
        .with_invite_code(options.invite_code.clone())
}

fn email_sender(options: &email::Options, timeout: Duration) -> Result<Arc<dyn EmailSender>> {
    match (&options.api_url, &options.api_key) {
        (Some(url), Some(key)) => Ok(Arc::new(HttpEmailSender::new(
            url.clone(),
            key.clone(),
            timeout,
        )?)),
        (Some(_), None) => Err(anyhow!("--email-api-url requires --email-api-key")),
        (None, _) => Ok(Arc::new(LogEmailSender)),
    }
}

fn log_startup_args(args: &Args) {
    let entries = [
        ("listen", format!("tcp:{}", args.port)),
        (
            "dsn",
            args.dsn
                .as_deref()
                .map_or_else(|| "none (in-memory)".to_string(), redact_dsn),
        ),
        ("environment", args.auth.mode.as_str().to_string()),
        ("base_url", args.auth.base_url.clone()),
        (
            "session_ttl_seconds",
            args.auth.session_ttl_seconds.to_string(),
        ),
        (
            "invite_code_set",
            args.auth.invite_code.is_some().to_string(),
        ),
        (
            "email_api_url",
            args.email
                .api_url
                .as_ref()
                .map_or_else(|| "none (log only)".to_string(), ToString::to_string),
        ),
        ("email_from", args.email.from.clone()),
    ];
    log_entries("Startup configuration", &entries);
}

fn redact_dsn(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("REDACTED"));
            }
            parsed.to_string()
        }
        Err(_) => "invalid-dsn".to_string(),
    }
}

fn log_entries(title: &str, entries: &[(&str, String)]) {
    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!(
        "clientele {} - {}\n\n{title}:",
        env!("CARGO_PKG_VERSION"),
        short_commit(crate::GIT_COMMIT_HASH)
    );
    for (key, value) in entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ =
            std::fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    info!("{message}");
}

fn short_commit(hash: &str) -> String {
    let trimmed = hash.trim();
    if trimmed.len() > 7 {
        trimmed[..7].to_string()
    } else {
        trimmed.to_string()
    }
}
