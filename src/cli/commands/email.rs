use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;
use url::Url;

pub const ARG_EMAIL_API_URL: &str = "email-api-url";
pub const ARG_EMAIL_API_KEY: &str = "email-api-key";
pub const ARG_EMAIL_FROM: &str = "email-from";
pub const ARG_EMAIL_TIMEOUT: &str = "email-timeout-seconds";

/// Delivery settings. Without an API URL emails are only logged.
#[derive(Debug)]
pub struct Options {
    pub api_url: Option<Url>,
    pub api_key: Option<SecretString>,
    pub from: String,
    pub timeout_seconds: u64,
}

impl Options {
    /// # Errors
    /// Returns an error if the API URL cannot be parsed.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let api_url = matches
            .get_one::<String>(ARG_EMAIL_API_URL)
            .map(|raw| Url::parse(raw).with_context(|| format!("invalid --{ARG_EMAIL_API_URL}")))
            .transpose()?;
        let api_key = matches
            .get_one::<String>(ARG_EMAIL_API_KEY)
            .map(|key| SecretString::from(key.clone()));
        let from = matches
            .get_one::<String>(ARG_EMAIL_FROM)
            .cloned()
            .context("missing required argument: --email-from")?;
        let timeout_seconds = matches
            .get_one::<u64>(ARG_EMAIL_TIMEOUT)
            .copied()
            .unwrap_or(30);

        Ok(Self {
            api_url,
            api_key,
            from,
            timeout_seconds,
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_EMAIL_API_URL)
                .long(ARG_EMAIL_API_URL)
                .help("HTTP endpoint of the transactional email provider")
                .env("CLIENTELE_EMAIL_API_URL")
                .requires(ARG_EMAIL_API_KEY),
        )
        .arg(
            Arg::new(ARG_EMAIL_API_KEY)
                .long(ARG_EMAIL_API_KEY)
                .help("Bearer token for the email provider")
                .env("CLIENTELE_EMAIL_API_KEY")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_EMAIL_FROM)
                .long(ARG_EMAIL_FROM)
                .help("Sender address for outgoing emails")
                .env("CLIENTELE_EMAIL_FROM")
                .default_value("Clientele <no-reply@clientele.dev>"),
        )
        .arg(
            Arg::new(ARG_EMAIL_TIMEOUT)
                .long(ARG_EMAIL_TIMEOUT)
                .help("Give up on a single email after this many seconds")
                .env("CLIENTELE_EMAIL_TIMEOUT_SECONDS")
                .default_value("30")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
}
