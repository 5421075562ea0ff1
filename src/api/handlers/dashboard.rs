use axum::{
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use tracing::error;

use super::auth::{AuthState, CurrentUser, csrf};
use crate::api::views;

// axum handler for the landing page of verified users
pub async fn dashboard(
    State(state): State<AuthState>,
    headers: HeaderMap,
    CurrentUser(user): CurrentUser,
) -> Response {
    match csrf::ensure_token(state.config(), &headers) {
        Ok(csrf) => views::dashboard_page(&user, &csrf).into_response(),
        Err(err) => {
            error!("Failed to issue csrf token: {err:#}");
            views::error_page().into_response()
        }
    }
}
