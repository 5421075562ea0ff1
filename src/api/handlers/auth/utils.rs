//! Small helpers for auth validation, cookies and email links.

use axum::http::{HeaderMap, header::COOKIE};
use regex::Regex;
use subtle::ConstantTimeEq;
use url::form_urlencoded;

pub const MIN_PASSWORD_LEN: usize = 8;

/// Normalize an email for lookup/uniqueness checks.
pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Basic email format check on already-normalized input.
pub(crate) fn valid_email(email_normalized: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email_normalized))
}

/// Read a cookie value by name from the request headers.
pub(crate) fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(value) = header.to_str() else {
            continue;
        };
        for pair in value.split(';') {
            let mut parts = pair.trim().splitn(2, '=');
            let key = parts.next().unwrap_or_default().trim();
            let Some(val) = parts.next() else {
                continue;
            };
            if key == name {
                return Some(val.trim().to_string());
            }
        }
    }
    None
}

/// Byte comparison that does not short-circuit on the first difference.
pub(crate) fn constant_time_eq(left: &str, right: &str) -> bool {
    left.as_bytes().ct_eq(right.as_bytes()).into()
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

/// `path?key=value` with the value form-encoded.
pub(crate) fn with_query(path: &str, key: &str, value: &str) -> String {
    form_urlencoded::Serializer::new(format!("{path}?"))
        .append_pair(key, value)
        .finish()
}

/// Link included in verification emails.
pub(crate) fn build_verify_url(base_url: &str, token: &str) -> String {
    let base = base_url.trim_end_matches('/');
    with_query(&format!("{base}/verify-email"), "token", token)
}

/// Link included in password reset emails.
pub(crate) fn build_reset_url(base_url: &str, token: &str) -> String {
    let base = base_url.trim_end_matches('/');
    with_query(&format!("{base}/reset-password"), "token", token)
}
