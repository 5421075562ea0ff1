//! Login and logout.
//!
//! Every credential failure renders the same page with the same status; the
//! user service pays the same hashing cost for unknown emails, so neither
//! the body nor the timing tells a visitor whether an account exists.

use anyhow::{Context, Result};
use axum::{
    Form,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use secrecy::SecretString;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::{
    csrf,
    redirect::{is_safe_redirect_url, safe_return_to, see_other, with_cookies},
    session::{clear_session_cookie, session_cookie, session_token},
    state::{AuthState, LOGIN_PATH},
    types::{CsrfForm, LoginForm, LoginQuery},
    utils::normalize_email,
};
use crate::api::views;
use crate::users::ServiceError;

pub(crate) const INVALID_CREDENTIALS: &str = "Invalid email or password.";
const MISSING_CREDENTIALS: &str = "Email and password are required.";

/// Create a session and rotate the CSRF token; returns the cookies to set.
pub(crate) async fn sign_in(state: &AuthState, user_id: Uuid) -> Result<Vec<HeaderValue>> {
    let token = state.sessions().create_session(user_id).await?;
    let session = session_cookie(state.config(), &token).context("failed to build session cookie")?;
    let mut cookies = vec![session];
    if let Some(cookie) = csrf::refresh_token(state.config())?.set_cookie {
        cookies.push(cookie);
    }
    Ok(cookies)
}

fn login_notice(query: &LoginQuery) -> Option<&'static str> {
    if query.reset.is_some() {
        Some("Your password has been reset. Please log in.")
    } else if query.password_changed.is_some() {
        Some("Your password was changed. Please log in again.")
    } else if query.verified.is_some() {
        Some("Your email is verified. Please log in.")
    } else {
        None
    }
}

pub async fn login_form(
    State(state): State<AuthState>,
    headers: HeaderMap,
    Query(query): Query<LoginQuery>,
) -> Response {
    let csrf = match csrf::ensure_token(state.config(), &headers) {
        Ok(csrf) => csrf,
        Err(err) => {
            error!("Failed to issue csrf token: {err:#}");
            return views::error_page().into_response();
        }
    };
    let return_to = query
        .return_to
        .as_deref()
        .filter(|value| is_safe_redirect_url(value));
    views::login_page(
        StatusCode::OK,
        &csrf,
        "",
        return_to,
        None,
        login_notice(&query),
    )
    .into_response()
}

#[instrument(skip_all)]
pub async fn login(
    State(state): State<AuthState>,
    headers: HeaderMap,
    Form(form): Form<LoginForm>,
) -> Response {
    if !csrf::validate_request(&headers, form.csrf_token.as_deref()) {
        warn!("Login rejected: csrf token mismatch");
        return views::csrf_failure_page().into_response();
    }
    let csrf = match csrf::ensure_token(state.config(), &headers) {
        Ok(csrf) => csrf,
        Err(err) => {
            error!("Failed to issue csrf token: {err:#}");
            return views::error_page().into_response();
        }
    };
    let typed_email = form.email.trim();
    let return_to = form
        .return_to
        .as_deref()
        .filter(|value| is_safe_redirect_url(value));
    let render_failure = |status: StatusCode, message: &str| {
        views::login_page(status, &csrf, typed_email, return_to, Some(message), None)
            .into_response()
    };

    if typed_email.is_empty() || form.password.is_empty() {
        return render_failure(StatusCode::UNPROCESSABLE_ENTITY, MISSING_CREDENTIALS);
    }

    let email = normalize_email(&form.email);
    let password = SecretString::from(form.password);
    let user = match state.users().login(&email, &password).await {
        Ok(user) => user,
        Err(ServiceError::Internal(err)) => {
            error!("Failed to check credentials: {err:#}");
            return render_failure(StatusCode::INTERNAL_SERVER_ERROR, views::GENERIC_ERROR);
        }
        Err(_) => return render_failure(StatusCode::UNAUTHORIZED, INVALID_CREDENTIALS),
    };

    match sign_in(&state, user.id).await {
        Ok(cookies) => {
            info!(user_id = %user.id, "user logged in");
            with_cookies(see_other(&headers, &safe_return_to(return_to)), cookies)
        }
        Err(err) => {
            error!("Failed to create session: {err:#}");
            render_failure(StatusCode::INTERNAL_SERVER_ERROR, views::GENERIC_ERROR)
        }
    }
}

/// Logout always clears the cookie and lands on the login page.
///
/// The server-side session is only deleted when the CSRF check passes.
#[instrument(skip_all)]
pub async fn logout(
    State(state): State<AuthState>,
    headers: HeaderMap,
    Form(form): Form<CsrfForm>,
) -> Response {
    if !csrf::validate_request(&headers, form.csrf_token.as_deref()) {
        warn!("Logout without a valid csrf token: keeping the server session");
    } else if let Some(token) = session_token(&headers) {
        if let Err(err) = state.sessions().invalidate_session(&token).await {
            error!("Failed to delete session: {err:#}");
        }
    }

    let mut cookies = Vec::new();
    match clear_session_cookie(state.config()) {
        Ok(cookie) => cookies.push(cookie),
        Err(err) => error!("Failed to build session cookie: {err}"),
    }
    with_cookies(see_other(&headers, LOGIN_PATH), cookies)
}
