use crate::GIT_COMMIT_HASH;
use axum::{
    body::Body,
    extract::Extension,
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use sqlx::{Connection, PgPool};
use tracing::{Instrument, debug, error, info_span};

#[derive(Serialize, Deserialize, Debug)]
pub struct Health {
    commit: String,
    name: String,
    version: String,
    database: String,
}

async fn database_status(pool: Option<&PgPool>) -> &'static str {
    let Some(pool) = pool else {
        return "memory";
    };
    let acquire_span = info_span!(
        "db.acquire",
        db.system = "postgresql",
        db.operation = "ACQUIRE"
    );
    match pool.acquire().instrument(acquire_span).await {
        Ok(mut conn) => {
            let ping_span = info_span!("db.ping", db.system = "postgresql", db.operation = "PING");
            match conn.ping().instrument(ping_span).await {
                Ok(()) => "ok",
                Err(error) => {
                    error!("Failed to ping database: {}", error);
                    "error"
                }
            }
        }
        Err(error) => {
            error!("Failed to acquire database connection: {}", error);
            "error"
        }
    }
}

// axum handler for health
pub async fn health(method: Method, pool: Option<Extension<PgPool>>) -> impl IntoResponse {
    let database = database_status(pool.as_ref().map(|Extension(pool)| pool)).await;
    let is_healthy = database != "error";

    let health = Health {
        commit: GIT_COMMIT_HASH.to_string(),
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: database.to_string(),
    };

    let body = if method == Method::GET {
        Json(&health).into_response()
    } else {
        Body::empty().into_response()
    };

    let short_hash = if health.commit.len() > 7 {
        &health.commit[0..7]
    } else {
        ""
    };

    let mut headers = HeaderMap::new();
    match format!("{}:{}:{}", health.name, health.version, short_hash).parse::<HeaderValue>() {
        Ok(x_app_header_value) => {
            debug!("X-App header: {:?}", x_app_header_value);
            headers.insert("X-App", x_app_header_value);
        }
        Err(err) => error!("Failed to parse X-App header: {}", err),
    }

    if is_healthy {
        (StatusCode::OK, headers, body)
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, headers, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use axum::{Router, body::to_bytes, http::Request, routing::get};
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_without_database_reports_memory() -> Result<()> {
        let app = Router::new().route("/health", get(health).head(health));
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let x_app = response
            .headers()
            .get("X-App")
            .map(HeaderValue::to_str)
            .transpose()?
            .unwrap_or_default()
            .to_string();
        assert!(x_app.starts_with(env!("CARGO_PKG_NAME")));

        let body = to_bytes(response.into_body(), usize::MAX).await?;
        let health: Health = serde_json::from_slice(&body)?;
        assert_eq!(health.database, "memory");
        assert_eq!(health.version, env!("CARGO_PKG_VERSION"));
        Ok(())
    }

    #[tokio::test]
    async fn head_returns_empty_body() -> Result<()> {
        let app = Router::new().route("/health", get(health).head(health));
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::HEAD)
                    .uri("/health")
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await?;
        assert!(body.is_empty());
        Ok(())
    }
}
