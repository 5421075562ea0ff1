//! Account settings: profile and password change.
//!
//! A new email address resets verification and sends a fresh link. A password
//! change signs the user out everywhere, this browser included.

use axum::{
    Form,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use secrecy::SecretString;
use serde::Deserialize;
use tracing::{error, info, instrument, warn};

use super::auth::{
    AuthState, CurrentUser, csrf,
    password::password_errors,
    redirect::{see_other, with_cookies},
    register::EMAIL_ERROR,
    session::clear_session_cookie,
    state::{LOGIN_PATH, VERIFY_REMINDER_PATH},
    types::{ChangePasswordForm, ProfileForm},
    utils::{normalize_email, valid_email},
};
use crate::api::views::{self, FieldErrors, ProfileValues};
use crate::users::{ProfileUpdate, ServiceError, User};

const PROFILE_SAVED: &str = "Your profile was saved.";
const WRONG_PASSWORD: &str = "Current password is incorrect";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SettingsQuery {
    pub saved: Option<String>,
}

fn render(
    state: &AuthState,
    headers: &HeaderMap,
    status: StatusCode,
    user: &User,
    profile: &ProfileValues,
    errors: &FieldErrors,
    message: Option<&str>,
) -> Response {
    match csrf::ensure_token(state.config(), headers) {
        Ok(csrf) => {
            views::settings_page(status, user, &csrf, profile, errors, message).into_response()
        }
        Err(err) => {
            error!("Failed to issue csrf token: {err:#}");
            views::error_page().into_response()
        }
    }
}

pub async fn settings(
    State(state): State<AuthState>,
    headers: HeaderMap,
    CurrentUser(user): CurrentUser,
    Query(query): Query<SettingsQuery>,
) -> Response {
    let profile = ProfileValues {
        name: user.name.clone(),
        email: user.email.clone(),
    };
    let message = query.saved.is_some().then_some(PROFILE_SAVED);
    render(
        &state,
        &headers,
        StatusCode::OK,
        &user,
        &profile,
        &FieldErrors::new(),
        message,
    )
}

#[instrument(skip_all, fields(user_id = %user.id))]
pub async fn update_profile(
    State(state): State<AuthState>,
    headers: HeaderMap,
    CurrentUser(user): CurrentUser,
    Form(form): Form<ProfileForm>,
) -> Response {
    if !csrf::validate_request(&headers, form.csrf_token.as_deref()) {
        warn!("Profile update rejected: csrf token mismatch");
        return views::csrf_failure_page().into_response();
    }
    let profile = ProfileValues {
        name: form.name.trim().to_string(),
        email: form.email.trim().to_string(),
    };
    let email = normalize_email(&form.email);
    let mut errors = FieldErrors::new();
    if profile.name.is_empty() {
        errors.add("name", "Name is required");
    }
    if !valid_email(&email) {
        errors.add("email", EMAIL_ERROR);
    }
    if !errors.is_empty() {
        return render(
            &state,
            &headers,
            StatusCode::UNPROCESSABLE_ENTITY,
            &user,
            &profile,
            &errors,
            None,
        );
    }

    let update = ProfileUpdate {
        name: profile.name.clone(),
        email,
    };
    let change = match state.users().update_profile(user.id, update).await {
        Ok(change) => change,
        Err(ServiceError::Conflict { .. }) => {
            errors.add("email", EMAIL_ERROR);
            return render(
                &state,
                &headers,
                StatusCode::UNPROCESSABLE_ENTITY,
                &user,
                &profile,
                &errors,
                None,
            );
        }
        Err(ServiceError::Invalid { field, message }) => {
            errors.add(field, message);
            return render(
                &state,
                &headers,
                StatusCode::UNPROCESSABLE_ENTITY,
                &user,
                &profile,
                &errors,
                None,
            );
        }
        Err(err) => {
            error!("Failed to update profile: {err:#}");
            errors.add("form", views::GENERIC_ERROR);
            return render(
                &state,
                &headers,
                StatusCode::INTERNAL_SERVER_ERROR,
                &user,
                &profile,
                &errors,
                None,
            );
        }
    };

    if !change.email_changed {
        return see_other(&headers, "/settings?saved=1");
    }
    info!("email address changed");
    match state
        .users()
        .create_email_verification_token(change.user.id)
        .await
    {
        Ok(token) => {
            state
                .mailer()
                .send_verification_email(&change.user.email, &change.user.name, &token);
        }
        Err(err) => error!("Failed to create verification token: {err:#}"),
    }
    see_other(&headers, &format!("{VERIFY_REMINDER_PATH}?sent=1"))
}

#[instrument(skip_all, fields(user_id = %user.id))]
pub async fn change_password(
    State(state): State<AuthState>,
    headers: HeaderMap,
    CurrentUser(user): CurrentUser,
    Form(form): Form<ChangePasswordForm>,
) -> Response {
    if !csrf::validate_request(&headers, form.csrf_token.as_deref()) {
        warn!("Password change rejected: csrf token mismatch");
        return views::csrf_failure_page().into_response();
    }
    let profile = ProfileValues {
        name: user.name.clone(),
        email: user.email.clone(),
    };
    let mut errors = password_errors(
        &form.new_password,
        &form.new_password_confirmation,
        "new_password",
        "new_password_confirmation",
    );
    if form.current_password.is_empty() {
        errors.add("current_password", "Current password is required");
    }
    if !errors.is_empty() {
        return render(
            &state,
            &headers,
            StatusCode::UNPROCESSABLE_ENTITY,
            &user,
            &profile,
            &errors,
            None,
        );
    }

    let current = SecretString::from(form.current_password);
    let new_password = SecretString::from(form.new_password);
    match state
        .users()
        .change_password(user.id, &current, &new_password)
        .await
    {
        Ok(()) => {}
        Err(ServiceError::Unauthorized) => {
            errors.add("current_password", WRONG_PASSWORD);
            return render(
                &state,
                &headers,
                StatusCode::UNPROCESSABLE_ENTITY,
                &user,
                &profile,
                &errors,
                None,
            );
        }
        Err(err) => {
            error!("Failed to change password: {err:#}");
            errors.add("form", views::GENERIC_ERROR);
            return render(
                &state,
                &headers,
                StatusCode::INTERNAL_SERVER_ERROR,
                &user,
                &profile,
                &errors,
                None,
            );
        }
    }

    if let Err(err) = state
        .sessions()
        .invalidate_all_sessions_for_user(user.id)
        .await
    {
        error!("Failed to invalidate sessions after password change: {err:#}");
        return views::error_page().into_response();
    }
    info!("password changed");

    let mut cookies = Vec::new();
    match clear_session_cookie(state.config()) {
        Ok(cookie) => cookies.push(cookie),
        Err(err) => error!("Failed to build session cookie: {err}"),
    }
    with_cookies(
        see_other(&headers, &format!("{LOGIN_PATH}?password_changed=1")),
        cookies,
    )
}
