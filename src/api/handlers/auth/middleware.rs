//! Page gates.
//!
//! `with_user` runs on every route and never blocks; the tier gates run after
//! it in a fixed order (`require_user` then `require_email_verified`).
//! Unverified users are sent to the reminder page, which itself sits in the
//! `Authenticated` tier, so the two gates cannot bounce a visitor in a loop.

use axum::{
    Json, Router,
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{StatusCode, request::Parts},
    middleware::{self, Next},
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::convert::Infallible;
use tracing::error;

use super::{
    redirect::{login_url, see_other, wants_json},
    session::session_token,
    state::{AuthState, DEFAULT_LANDING_PATH, VERIFY_REMINDER_PATH},
};
use crate::users::User;

/// Request extension set by [`with_user`]: the signed-in user, if any.
#[derive(Clone, Debug, Default)]
pub struct MaybeUser(pub Option<User>);

impl MaybeUser {
    #[must_use]
    pub fn user(&self) -> Option<&User> {
        self.0.as_ref()
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for MaybeUser {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts.extensions.get::<Self>().cloned().unwrap_or_default())
    }
}

/// Extractor for handlers behind `require_user`.
#[derive(Clone, Debug)]
pub struct CurrentUser(pub User);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for CurrentUser {
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<MaybeUser>()
            .and_then(|maybe| maybe.0.clone())
            .map(Self)
            .ok_or(StatusCode::UNAUTHORIZED)
    }
}

/// Resolve the session cookie and attach a [`MaybeUser`] to the request.
/// Store errors are logged and the visitor is treated as anonymous.
pub async fn with_user(State(state): State<AuthState>, mut request: Request, next: Next) -> Response {
    let user = match session_token(request.headers()) {
        Some(token) => match state
            .sessions()
            .resolve_session(&token, state.users())
            .await
        {
            Ok(user) => user,
            Err(err) => {
                error!("Failed to resolve session: {err:#}");
                None
            }
        },
        None => None,
    };
    request.extensions_mut().insert(MaybeUser(user));
    next.run(request).await
}

fn current_user(request: &Request) -> Option<&User> {
    request
        .extensions()
        .get::<MaybeUser>()
        .and_then(MaybeUser::user)
}

fn unauthenticated(request: &Request) -> Response {
    if wants_json(request.headers()) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "unauthorized" })),
        )
            .into_response();
    }
    let original = request
        .uri()
        .path_and_query()
        .map_or("/", |path_and_query| path_and_query.as_str());
    see_other(request.headers(), &login_url(original))
}

/// Only signed-in users pass; everyone else goes to the login page.
pub async fn require_user(request: Request, next: Next) -> Response {
    if current_user(&request).is_none() {
        return unauthenticated(&request);
    }
    next.run(request).await
}

/// Only verified users pass; unverified users go to the reminder page.
pub async fn require_email_verified(request: Request, next: Next) -> Response {
    match current_user(&request) {
        None => unauthenticated(&request),
        Some(user) if !user.email_verified => {
            if wants_json(request.headers()) {
                (
                    StatusCode::FORBIDDEN,
                    Json(json!({ "error": "email_not_verified" })),
                )
                    .into_response()
            } else {
                see_other(request.headers(), VERIFY_REMINDER_PATH)
            }
        }
        Some(_) => next.run(request).await,
    }
}

/// Signed-in users are sent to the landing page (login, register).
pub async fn require_anonymous(request: Request, next: Next) -> Response {
    if current_user(&request).is_some() {
        return see_other(request.headers(), DEFAULT_LANDING_PATH);
    }
    next.run(request).await
}

/// Who may reach a group of routes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tier {
    /// Anyone; the user is still resolved when a session exists.
    Public,
    /// Visitors without a session.
    Anonymous,
    /// Any signed-in user, verified or not.
    Authenticated,
    /// Signed-in users with a verified email.
    Verified,
}

/// Apply the gates of `tier` to every route already in `router`.
///
/// `route_layer` wraps outside-in, so the gates are added last-to-first to
/// run as `with_user`, then `require_user`, then `require_email_verified`.
pub fn protect(router: Router<AuthState>, tier: Tier, state: AuthState) -> Router<AuthState> {
    let router = match tier {
        Tier::Public => router,
        Tier::Anonymous => router.route_layer(middleware::from_fn(require_anonymous)),
        Tier::Authenticated => router.route_layer(middleware::from_fn(require_user)),
        Tier::Verified => router
            .route_layer(middleware::from_fn(require_email_verified))
            .route_layer(middleware::from_fn(require_user)),
    };
    router.route_layer(middleware::from_fn_with_state(state, with_user))
}
