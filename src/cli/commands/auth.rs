use crate::api::handlers::auth::{DeploymentMode, MAX_TTL_SECONDS};
use anyhow::{Context, Result, anyhow};
use clap::{Arg, ArgMatches, Command};
use url::Url;

pub const ARG_BASE_URL: &str = "base-url";
pub const ARG_ENVIRONMENT: &str = "environment";
pub const ARG_SESSION_TTL: &str = "session-ttl-seconds";
pub const ARG_EMAIL_TOKEN_TTL: &str = "email-token-ttl-seconds";
pub const ARG_RESET_TOKEN_TTL: &str = "reset-token-ttl-seconds";
pub const ARG_CSRF_TTL: &str = "csrf-ttl-seconds";
pub const ARG_RESEND_COOLDOWN: &str = "resend-cooldown-seconds";
pub const ARG_INVITE_CODE: &str = "invite-code";
pub const ARG_SWEEP_INTERVAL: &str = "sweep-interval-seconds";

const MAX_SWEEP_INTERVAL_SECONDS: u64 = 24 * 60 * 60;

#[derive(Debug)]
pub struct Options {
    pub base_url: String,
    pub mode: DeploymentMode,
    pub session_ttl_seconds: i64,
    pub email_token_ttl_seconds: i64,
    pub reset_token_ttl_seconds: i64,
    pub csrf_ttl_seconds: i64,
    pub resend_cooldown_seconds: i64,
    pub invite_code: Option<String>,
    pub sweep_interval_seconds: u64,
}

impl Options {
    /// # Errors
    /// Returns an error if the base URL is not absolute http(s) or the
    /// environment name is unknown.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let raw_base_url = matches
            .get_one::<String>(ARG_BASE_URL)
            .context("missing required argument: --base-url")?;
        let base_url = normalize_base_url(raw_base_url)?;

        let environment = matches
            .get_one::<String>(ARG_ENVIRONMENT)
            .map_or("development", String::as_str);
        let mode = DeploymentMode::parse(environment)
            .ok_or_else(|| anyhow!("invalid --environment: {environment}"))?;

        let seconds = |name: &str, fallback: i64| {
            matches.get_one::<i64>(name).copied().unwrap_or(fallback)
        };

        Ok(Self {
            base_url,
            mode,
            session_ttl_seconds: seconds(ARG_SESSION_TTL, 604_800),
            email_token_ttl_seconds: seconds(ARG_EMAIL_TOKEN_TTL, 86_400),
            reset_token_ttl_seconds: seconds(ARG_RESET_TOKEN_TTL, 3_600),
            csrf_ttl_seconds: seconds(ARG_CSRF_TTL, 3_600),
            resend_cooldown_seconds: seconds(ARG_RESEND_COOLDOWN, 60),
            invite_code: matches.get_one::<String>(ARG_INVITE_CODE).cloned(),
            sweep_interval_seconds: matches
                .get_one::<u64>(ARG_SWEEP_INTERVAL)
                .copied()
                .unwrap_or(300),
        })
    }
}

/// Links in emails are built by appending paths, so drop the trailing slash.
fn normalize_base_url(raw: &str) -> Result<String> {
    let url = Url::parse(raw.trim()).with_context(|| format!("invalid --base-url: {raw}"))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(anyhow!("--base-url must be an absolute http(s) URL: {raw}"));
    }
    Ok(url.as_str().trim_end_matches('/').to_string())
}

fn bounded_seconds(arg: Arg, min: i64) -> Arg {
    arg.value_parser(clap::value_parser!(i64).range(min..=MAX_TTL_SECONDS))
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_site_args(command);
    with_lifetime_args(command)
}

fn with_site_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_BASE_URL)
                .long(ARG_BASE_URL)
                .help("Public base URL used for links in emails")
                .env("CLIENTELE_BASE_URL")
                .default_value("http://localhost:8080"),
        )
        .arg(
            Arg::new(ARG_ENVIRONMENT)
                .long(ARG_ENVIRONMENT)
                .help("Deployment mode; production marks cookies Secure")
                .env("CLIENTELE_ENVIRONMENT")
                .default_value("development")
                .value_parser(["production", "development"]),
        )
        .arg(
            Arg::new(ARG_INVITE_CODE)
                .long(ARG_INVITE_CODE)
                .help("Require this invite code on registration")
                .env("CLIENTELE_INVITE_CODE"),
        )
}

fn with_lifetime_args(command: Command) -> Command {
    command
        .arg(bounded_seconds(
            Arg::new(ARG_SESSION_TTL)
                .long(ARG_SESSION_TTL)
                .help("Session lifetime in seconds")
                .env("CLIENTELE_SESSION_TTL_SECONDS")
                .default_value("604800"),
            1,
        ))
        .arg(bounded_seconds(
            Arg::new(ARG_EMAIL_TOKEN_TTL)
                .long(ARG_EMAIL_TOKEN_TTL)
                .help("Email verification link lifetime in seconds")
                .env("CLIENTELE_EMAIL_TOKEN_TTL_SECONDS")
                .default_value("86400"),
            1,
        ))
        .arg(bounded_seconds(
            Arg::new(ARG_RESET_TOKEN_TTL)
                .long(ARG_RESET_TOKEN_TTL)
                .help("Password reset link lifetime in seconds")
                .env("CLIENTELE_RESET_TOKEN_TTL_SECONDS")
                .default_value("3600"),
            1,
        ))
        .arg(bounded_seconds(
            Arg::new(ARG_CSRF_TTL)
                .long(ARG_CSRF_TTL)
                .help("CSRF cookie lifetime in seconds")
                .env("CLIENTELE_CSRF_TTL_SECONDS")
                .default_value("3600"),
            1,
        ))
        .arg(bounded_seconds(
            Arg::new(ARG_RESEND_COOLDOWN)
                .long(ARG_RESEND_COOLDOWN)
                .help("Minimum seconds between verification emails for one account")
                .env("CLIENTELE_RESEND_COOLDOWN_SECONDS")
                .default_value("60"),
            0,
        ))
        .arg(
            Arg::new(ARG_SWEEP_INTERVAL)
                .long(ARG_SWEEP_INTERVAL)
                .help("How often expired sessions and tokens are purged, in seconds")
                .env("CLIENTELE_SWEEP_INTERVAL_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(u64).range(1..=MAX_SWEEP_INTERVAL_SECONDS)),
        )
}
