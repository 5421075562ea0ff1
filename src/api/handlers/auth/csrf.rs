//! CSRF double-submit guard.
//!
//! The token lives in a readable cookie and is echoed back in the
//! `csrf_token` form field or the `X-CSRF-Token` header. There is no server
//! state: a request passes when the two values match.

use anyhow::{Context, Result};
use axum::http::{HeaderMap, HeaderValue};

use super::{
    state::{AuthConfig, CSRF_COOKIE_NAME, CSRF_HEADER},
    token::{self, TokenKind},
    utils::{constant_time_eq, read_cookie},
};

/// The token to embed in forms, plus the cookie that (re)sets it.
#[derive(Clone, Debug)]
pub struct CsrfToken {
    pub value: String,
    pub set_cookie: Option<HeaderValue>,
}

/// Reuse the browser's token when it is well formed, otherwise issue one.
/// A reused token is sent back with a fresh `Max-Age` so an open tab keeps it.
///
/// # Errors
/// Returns an error if a new token cannot be generated.
pub fn ensure_token(config: &AuthConfig, headers: &HeaderMap) -> Result<CsrfToken> {
    match read_cookie(headers, CSRF_COOKIE_NAME).filter(|value| token::looks_like_token(value)) {
        Some(value) => {
            let cookie = csrf_cookie(config, &value).context("failed to build csrf cookie")?;
            Ok(CsrfToken {
                value,
                set_cookie: Some(cookie),
            })
        }
        None => refresh_token(config),
    }
}

/// Always issue a fresh token (after login and registration).
///
/// # Errors
/// Returns an error if a new token cannot be generated.
pub fn refresh_token(config: &AuthConfig) -> Result<CsrfToken> {
    // CSRF values reuse the session token shape; only the cookie differs.
    let issued = token::issue(TokenKind::Session)?;
    let cookie = csrf_cookie(config, &issued.raw).context("failed to build csrf cookie")?;
    Ok(CsrfToken {
        value: issued.raw,
        set_cookie: Some(cookie),
    })
}

/// Check a state-changing request. The submitted value comes from the form
/// field, or from the header when the form carried none. Fails closed.
#[must_use]
pub fn validate_request(headers: &HeaderMap, submitted: Option<&str>) -> bool {
    let Some(cookie) = read_cookie(headers, CSRF_COOKIE_NAME) else {
        return false;
    };
    let from_header = headers
        .get(CSRF_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim);
    let submitted = submitted
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .or(from_header);
    match submitted {
        Some(value) if !value.is_empty() && !cookie.is_empty() => constant_time_eq(&cookie, value),
        _ => false,
    }
}

fn csrf_cookie(config: &AuthConfig, value: &str) -> Result<HeaderValue> {
    let ttl_seconds = config.csrf_ttl_seconds();
    let mut cookie =
        format!("{CSRF_COOKIE_NAME}={value}; Path=/; SameSite=Strict; Max-Age={ttl_seconds}");
    if config.cookie_secure() {
        cookie.push_str("; Secure");
    }
    Ok(HeaderValue::from_str(&cookie)?)
}
