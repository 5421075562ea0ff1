//! Forgot-password and reset-password flows.
//!
//! A successful reset consumes the token, stores the new password, and then
//! deletes every session of the user before responding.

use axum::{
    Form,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use secrecy::SecretString;
use tracing::{debug, error, info, instrument, warn};

use super::{
    csrf,
    redirect::{see_other, with_cookies},
    session::clear_session_cookie,
    state::{AuthState, LOGIN_PATH},
    token::looks_like_token,
    types::{EmailForm, ResetPasswordForm, TokenQuery},
    utils::{MIN_PASSWORD_LEN, normalize_email, valid_email},
};
use crate::api::views::{self, FieldErrors};
use crate::users::ServiceError;

pub(crate) const RESET_SENT: &str =
    "If an account exists for that address, we sent a link to reset your password.";

/// Shared password rules for reset and change forms.
pub(crate) fn password_errors(
    password: &str,
    confirmation: &str,
    field: &'static str,
    confirmation_field: &'static str,
) -> FieldErrors {
    let mut errors = FieldErrors::new();
    if password.chars().count() < MIN_PASSWORD_LEN {
        errors.add(
            field,
            format!("Password must be at least {MIN_PASSWORD_LEN} characters"),
        );
    }
    if password != confirmation {
        errors.add(confirmation_field, "Passwords do not match");
    }
    errors
}

pub async fn forgot_form(State(state): State<AuthState>, headers: HeaderMap) -> Response {
    match csrf::ensure_token(state.config(), &headers) {
        Ok(csrf) => views::email_request_page(
            "Forgot your password?",
            "/forgot-password",
            "Enter your email address and we will send you a link to choose a new password.",
            &csrf,
            "Send reset link",
        )
        .into_response(),
        Err(err) => {
            error!("Failed to issue csrf token: {err:#}");
            views::error_page().into_response()
        }
    }
}

/// Always the same page, whether or not an account matched.
#[instrument(skip_all)]
pub async fn forgot_password(
    State(state): State<AuthState>,
    headers: HeaderMap,
    Form(form): Form<EmailForm>,
) -> Response {
    if !csrf::validate_request(&headers, form.csrf_token.as_deref()) {
        warn!("Forgot password rejected: csrf token mismatch");
        return views::csrf_failure_page().into_response();
    }
    let email = normalize_email(&form.email);
    if valid_email(&email) {
        match state.users().create_password_reset_token(&email).await {
            Ok(Some(issued)) => {
                state.mailer().send_password_reset_email(
                    &issued.user.email,
                    &issued.user.name,
                    &issued.token,
                );
            }
            Ok(None) => debug!("No account for reset request"),
            Err(err) => error!("Failed to create reset token: {err:#}"),
        }
    }
    views::message_page(
        StatusCode::OK,
        "Check your inbox",
        RESET_SENT,
        &[views::login_link()],
        None,
    )
    .into_response()
}

pub async fn reset_form(
    State(state): State<AuthState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Response {
    let Some(token) = query
        .token
        .as_deref()
        .map(str::trim)
        .filter(|token| looks_like_token(token))
    else {
        return views::invalid_reset_link_page().into_response();
    };
    match state.users().validate_password_reset_token(token).await {
        Ok(_) => {}
        Err(ServiceError::Internal(err)) => {
            error!("Failed to validate reset token: {err:#}");
            return views::error_page().into_response();
        }
        Err(_) => return views::invalid_reset_link_page().into_response(),
    }
    match csrf::ensure_token(state.config(), &headers) {
        Ok(csrf) => {
            views::reset_password_page(StatusCode::OK, &csrf, token, &FieldErrors::new())
                .into_response()
        }
        Err(err) => {
            error!("Failed to issue csrf token: {err:#}");
            views::error_page().into_response()
        }
    }
}

#[instrument(skip_all)]
pub async fn reset_password(
    State(state): State<AuthState>,
    headers: HeaderMap,
    Form(form): Form<ResetPasswordForm>,
) -> Response {
    if !csrf::validate_request(&headers, form.csrf_token.as_deref()) {
        warn!("Password reset rejected: csrf token mismatch");
        return views::csrf_failure_page().into_response();
    }
    let token = form.token.trim();
    if !looks_like_token(token) {
        return views::invalid_reset_link_page().into_response();
    }

    let errors = password_errors(
        &form.password,
        &form.password_confirmation,
        "password",
        "password_confirmation",
    );
    if !errors.is_empty() {
        return match csrf::ensure_token(state.config(), &headers) {
            Ok(csrf) => {
                views::reset_password_page(StatusCode::UNPROCESSABLE_ENTITY, &csrf, token, &errors)
                    .into_response()
            }
            Err(err) => {
                error!("Failed to issue csrf token: {err:#}");
                views::error_page().into_response()
            }
        };
    }

    let password = SecretString::from(form.password.clone());
    let user = match state.users().reset_password(token, &password).await {
        Ok(user) => user,
        Err(ServiceError::Internal(err)) => {
            error!("Failed to reset password: {err:#}");
            return views::error_page().into_response();
        }
        Err(_) => return views::invalid_reset_link_page().into_response(),
    };

    if let Err(err) = state
        .sessions()
        .invalidate_all_sessions_for_user(user.id)
        .await
    {
        error!("Failed to invalidate sessions after reset: {err:#}");
        return views::error_page().into_response();
    }
    info!(user_id = %user.id, "password reset");

    let mut cookies = Vec::new();
    match clear_session_cookie(state.config()) {
        Ok(cookie) => cookies.push(cookie),
        Err(err) => error!("Failed to build session cookie: {err}"),
    }
    with_cookies(see_other(&headers, &format!("{LOGIN_PATH}?reset=1")), cookies)
}
