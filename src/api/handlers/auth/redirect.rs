//! Post-action navigation and `return_to` handling.

use axum::{
    http::{
        HeaderMap, HeaderName, HeaderValue, StatusCode,
        header::{ACCEPT, LOCATION, SET_COOKIE},
    },
    response::{IntoResponse, Response},
};
use url::Url;

use super::{
    state::{DEFAULT_LANDING_PATH, LOGIN_PATH},
    utils::with_query,
};

pub const HX_REQUEST: HeaderName = HeaderName::from_static("hx-request");
pub const HX_REDIRECT: HeaderName = HeaderName::from_static("hx-redirect");

const DUMMY_BASE: &str = "http://redirect.invalid";

/// True when the request came from htmx.
#[must_use]
pub fn is_htmx(headers: &HeaderMap) -> bool {
    headers
        .get(HX_REQUEST)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("true"))
}

/// True when the client asked for JSON and not HTML.
#[must_use]
pub fn wants_json(headers: &HeaderMap) -> bool {
    let accept = headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect::<Vec<_>>()
        .join(",")
        .to_ascii_lowercase();
    accept.contains("application/json") && !accept.contains("text/html")
}

/// Navigate after an action: 303 for browsers, `HX-Redirect` for htmx.
#[must_use]
pub fn see_other(headers: &HeaderMap, location: &str) -> Response {
    let Ok(value) = HeaderValue::from_str(location) else {
        return (StatusCode::SEE_OTHER, [(LOCATION, HeaderValue::from_static("/"))])
            .into_response();
    };
    if is_htmx(headers) {
        (StatusCode::OK, [(HX_REDIRECT, value)]).into_response()
    } else {
        (StatusCode::SEE_OTHER, [(LOCATION, value)]).into_response()
    }
}

/// Append `Set-Cookie` headers to a response.
#[must_use]
pub fn with_cookies<I>(mut response: Response, cookies: I) -> Response
where
    I: IntoIterator<Item = HeaderValue>,
{
    for cookie in cookies {
        response.headers_mut().append(SET_COOKIE, cookie);
    }
    response
}

/// Only same-origin relative paths may be used as redirect targets.
#[must_use]
pub fn is_safe_redirect_url(candidate: &str) -> bool {
    if candidate.is_empty()
        || !candidate.starts_with('/')
        || candidate.starts_with("//")
        || candidate.contains('\\')
        || candidate.chars().any(char::is_control)
    {
        return false;
    }
    let Ok(base) = Url::parse(DUMMY_BASE) else {
        return false;
    };
    match base.join(candidate) {
        Ok(joined) => joined.scheme() == base.scheme() && joined.host() == base.host(),
        Err(_) => false,
    }
}

/// The `return_to` target when safe, the landing page otherwise.
#[must_use]
pub fn safe_return_to(candidate: Option<&str>) -> String {
    candidate
        .map(str::trim)
        .filter(|value| is_safe_redirect_url(value))
        .map_or_else(|| DEFAULT_LANDING_PATH.to_string(), ToString::to_string)
}

/// Login URL that brings the visitor back to `original` afterwards.
#[must_use]
pub fn login_url(original: &str) -> String {
    if is_safe_redirect_url(original) && original != LOGIN_PATH {
        with_query(LOGIN_PATH, "return_to", original)
    } else {
        LOGIN_PATH.to_string()
    }
}
