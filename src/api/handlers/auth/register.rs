//! Registration page and form handler.
//!
//! Flow Overview:
//! 1) Check the CSRF token before touching anything else.
//! 2) Validate fields locally and collect every error for the form.
//! 3) Create the account; a taken email is reported with the same text as a
//!    malformed one.
//! 4) Issue a verification token and hand the email to the mailer without
//!    waiting for delivery.
//! 5) Sign the user in (session + fresh CSRF token) and redirect.

use axum::{
    Form,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use secrecy::SecretString;
use tracing::{error, info, instrument, warn};

use super::{
    csrf,
    login::sign_in,
    redirect::{safe_return_to, see_other, with_cookies},
    state::{AuthState, LOGIN_PATH},
    types::{LoginQuery, RegisterForm},
    utils::{MIN_PASSWORD_LEN, constant_time_eq, normalize_email, valid_email},
};
use crate::api::views::{self, FieldErrors, RegisterValues};
use crate::users::{NewUser, ServiceError};

pub(crate) const EMAIL_ERROR: &str = "Email is invalid or already in use";

pub async fn register_form(
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
    let values = RegisterValues {
        return_to: query.return_to.filter(|value| super::redirect::is_safe_redirect_url(value)),
        ..RegisterValues::default()
    };
    views::register_page(
        StatusCode::OK,
        &csrf,
        &values,
        &FieldErrors::new(),
        state.config().invite_code().is_some(),
    )
    .into_response()
}

fn validate(form: &RegisterForm, email: &str, invite_code: Option<&str>) -> FieldErrors {
    let mut errors = FieldErrors::new();
    if form.name.trim().is_empty() {
        errors.add("name", "Name is required");
    }
    if !valid_email(email) {
        errors.add("email", EMAIL_ERROR);
    }
    if form.password.chars().count() < MIN_PASSWORD_LEN {
        errors.add(
            "password",
            format!("Password must be at least {MIN_PASSWORD_LEN} characters"),
        );
    }
    if form.password != form.password_confirmation {
        errors.add("password_confirmation", "Passwords do not match");
    }
    if !form
        .terms
        .as_deref()
        .is_some_and(|value| !value.trim().is_empty())
    {
        errors.add("terms", "You must accept the terms of service");
    }
    if let Some(expected) = invite_code {
        let submitted = form.invite_code.as_deref().unwrap_or_default().trim();
        if !constant_time_eq(expected, submitted) {
            errors.add("invite_code", "Invite code is not valid");
        }
    }
    errors
}

#[instrument(skip_all)]
pub async fn register(
    State(state): State<AuthState>,
    headers: HeaderMap,
    Form(form): Form<RegisterForm>,
) -> Response {
    if !csrf::validate_request(&headers, form.csrf_token.as_deref()) {
        warn!("Registration rejected: csrf token mismatch");
        return views::csrf_failure_page().into_response();
    }
    let csrf = match csrf::ensure_token(state.config(), &headers) {
        Ok(csrf) => csrf,
        Err(err) => {
            error!("Failed to issue csrf token: {err:#}");
            return views::error_page().into_response();
        }
    };

    let email = normalize_email(&form.email);
    let values = RegisterValues {
        name: form.name.trim().to_string(),
        email: form.email.trim().to_string(),
        return_to: form
            .return_to
            .clone()
            .filter(|value| super::redirect::is_safe_redirect_url(value)),
    };
    let invite_required = state.config().invite_code().is_some();
    let mut errors = validate(&form, &email, state.config().invite_code());
    if !errors.is_empty() {
        return views::register_page(
            StatusCode::UNPROCESSABLE_ENTITY,
            &csrf,
            &values,
            &errors,
            invite_required,
        )
        .into_response();
    }

    let new_user = NewUser {
        name: values.name.clone(),
        email,
        password: SecretString::from(form.password),
    };
    let user = match state.users().register(new_user).await {
        Ok(user) => user,
        Err(ServiceError::Conflict { .. }) => {
            errors.add("email", EMAIL_ERROR);
            return views::register_page(
                StatusCode::UNPROCESSABLE_ENTITY,
                &csrf,
                &values,
                &errors,
                invite_required,
            )
            .into_response();
        }
        Err(ServiceError::Invalid { field, message }) => {
            errors.add(field, message);
            return views::register_page(
                StatusCode::UNPROCESSABLE_ENTITY,
                &csrf,
                &values,
                &errors,
                invite_required,
            )
            .into_response();
        }
        Err(err) => {
            error!("Failed to register user: {err:#}");
            errors.add("form", views::GENERIC_ERROR);
            return views::register_page(
                StatusCode::INTERNAL_SERVER_ERROR,
                &csrf,
                &values,
                &errors,
                invite_required,
            )
            .into_response();
        }
    };
    info!(user_id = %user.id, "user registered");

    // The account exists now; a failed email only costs a resend.
    match state
        .users()
        .create_email_verification_token(user.id)
        .await
    {
        Ok(token) => {
            state
                .mailer()
                .send_verification_email(&user.email, &user.name, &token);
        }
        Err(err) => error!("Failed to create verification token: {err:#}"),
    }

    match sign_in(&state, user.id).await {
        Ok(cookies) => with_cookies(
            see_other(&headers, &safe_return_to(form.return_to.as_deref())),
            cookies,
        ),
        Err(err) => {
            error!("Failed to create session after registration: {err:#}");
            see_other(&headers, LOGIN_PATH)
        }
    }
}
