pub mod auth;
pub mod dashboard;
pub mod health;
pub mod settings;

use axum::{http::HeaderMap, response::Response};

use auth::{redirect::see_other, state::DEFAULT_LANDING_PATH};

// axum handler for "/"; the gates on the landing page decide where the visitor ends up
pub async fn root(headers: HeaderMap) -> Response {
    see_other(&headers, DEFAULT_LANDING_PATH)
}
