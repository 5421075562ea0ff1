//! Email verification: link handler, public resend and the signed-in reminder.

use axum::{
    Form,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{debug, error, info, instrument, warn};

use super::{
    csrf,
    middleware::{CurrentUser, MaybeUser},
    redirect::see_other,
    state::{AuthState, DEFAULT_LANDING_PATH, VERIFY_REMINDER_PATH},
    token::looks_like_token,
    types::{CsrfForm, EmailForm, SentQuery, TokenQuery},
    utils::{normalize_email, valid_email},
};
use crate::api::views;
use crate::users::{ServiceError, VerifyOutcome};

pub(crate) const RESEND_SENT: &str =
    "If an unverified account exists for that address, we sent a new confirmation link.";

fn invalid_link_page(user: Option<&crate::users::User>) -> Response {
    views::message_page(
        StatusCode::BAD_REQUEST,
        "Link expired",
        "This confirmation link is expired or invalid.",
        &[("/resend-verification", "Send a new confirmation link")],
        user,
    )
    .into_response()
}

#[instrument(skip_all)]
pub async fn verify_email(
    State(state): State<AuthState>,
    maybe_user: MaybeUser,
    Query(query): Query<TokenQuery>,
) -> Response {
    let Some(token) = query
        .token
        .as_deref()
        .map(str::trim)
        .filter(|token| looks_like_token(token))
    else {
        return invalid_link_page(maybe_user.user());
    };

    let continue_link = if maybe_user.user().is_some() {
        (DEFAULT_LANDING_PATH, "Continue to your dashboard")
    } else {
        views::login_link()
    };
    match state.users().verify_email(token).await {
        Ok(VerifyOutcome::Verified) => {
            info!("email verified");
            views::message_page(
                StatusCode::OK,
                "Email verified",
                "Thanks, your email address is verified.",
                &[continue_link],
                maybe_user.user(),
            )
            .into_response()
        }
        Ok(VerifyOutcome::AlreadyVerified) => views::message_page(
            StatusCode::OK,
            "Already verified",
            "Your email address is already verified.",
            &[continue_link],
            maybe_user.user(),
        )
        .into_response(),
        Err(ServiceError::Internal(err)) => {
            error!("Failed to verify email: {err:#}");
            views::error_page().into_response()
        }
        Err(_) => invalid_link_page(maybe_user.user()),
    }
}

pub async fn resend_form(State(state): State<AuthState>, headers: HeaderMap) -> Response {
    match csrf::ensure_token(state.config(), &headers) {
        Ok(csrf) => views::email_request_page(
            "Resend confirmation",
            "/resend-verification",
            "Enter your email address and we will send a new confirmation link.",
            &csrf,
            "Send link",
        )
        .into_response(),
        Err(err) => {
            error!("Failed to issue csrf token: {err:#}");
            views::error_page().into_response()
        }
    }
}

/// Always the same page, whatever happened behind it.
#[instrument(skip_all)]
pub async fn resend_verification(
    State(state): State<AuthState>,
    headers: HeaderMap,
    Form(form): Form<EmailForm>,
) -> Response {
    if !csrf::validate_request(&headers, form.csrf_token.as_deref()) {
        warn!("Resend rejected: csrf token mismatch");
        return views::csrf_failure_page().into_response();
    }
    let email = normalize_email(&form.email);
    if valid_email(&email) {
        match state.users().resend_verification_email(&email).await {
            Ok(Some(issued)) => {
                state
                    .mailer()
                    .send_verification_email(&issued.user.email, &issued.user.name, &issued.token);
            }
            Ok(None) => debug!("Resend skipped"),
            Err(err) => error!("Failed to resend verification: {err:#}"),
        }
    }
    views::message_page(
        StatusCode::OK,
        "Check your inbox",
        RESEND_SENT,
        &[views::login_link()],
        None,
    )
    .into_response()
}

pub async fn reminder(
    State(state): State<AuthState>,
    headers: HeaderMap,
    CurrentUser(user): CurrentUser,
    Query(query): Query<SentQuery>,
) -> Response {
    if user.email_verified {
        return see_other(&headers, DEFAULT_LANDING_PATH);
    }
    match csrf::ensure_token(state.config(), &headers) {
        Ok(csrf) => views::verify_reminder_page(&user, &csrf, query.sent.is_some()).into_response(),
        Err(err) => {
            error!("Failed to issue csrf token: {err:#}");
            views::error_page().into_response()
        }
    }
}

#[instrument(skip_all, fields(user_id = %user.id))]
pub async fn reminder_resend(
    State(state): State<AuthState>,
    headers: HeaderMap,
    CurrentUser(user): CurrentUser,
    Form(form): Form<CsrfForm>,
) -> Response {
    if !csrf::validate_request(&headers, form.csrf_token.as_deref()) {
        warn!("Reminder resend rejected: csrf token mismatch");
        return views::csrf_failure_page().into_response();
    }
    if user.email_verified {
        return see_other(&headers, DEFAULT_LANDING_PATH);
    }
    match state.users().resend_verification_email(&user.email).await {
        Ok(Some(issued)) => {
            state
                .mailer()
                .send_verification_email(&issued.user.email, &issued.user.name, &issued.token);
        }
        Ok(None) => debug!("Reminder resend skipped"),
        Err(err) => error!("Failed to resend verification: {err:#}"),
    }
    see_other(&headers, &format!("{VERIFY_REMINDER_PATH}?sent=1"))
}
