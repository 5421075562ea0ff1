//! HTTP server: router assembly, request tracing and startup.

use anyhow::{Context, Result};
use axum::{
    Extension, Router,
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    routing::{get, post},
};
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{Instrument, Span, info, info_span, warn};
use ulid::Ulid;

use crate::users::{UserService, memory::MemoryUserService, postgres::PgUserService};
use handlers::auth::{
    self, AuthConfig, AuthState, MemorySessionStore, PgSessionStore, SessionStore, Sessions, Tier,
    login, password, protect, register, sweeper, verification,
};
use handlers::{dashboard, health, settings};

pub mod email;
pub mod handlers;
pub mod views;

const SCHEMA: &str = include_str!("../../sql/schema.sql");

/// Everything `new` needs beyond the auth settings.
pub struct ServerOptions {
    pub port: u16,
    pub dsn: Option<String>,
    pub sweep_interval: Duration,
}

/// Build the page router. Every route belongs to exactly one tier.
pub fn router(state: AuthState) -> Router {
    let public = protect(
        Router::new()
            .route("/", get(handlers::root))
            .route("/logout", post(login::logout))
            .route("/verify-email", get(verification::verify_email))
            .route(
                "/resend-verification",
                get(verification::resend_form).post(verification::resend_verification),
            )
            .route(
                "/forgot-password",
                get(password::forgot_form).post(password::forgot_password),
            )
            .route(
                "/reset-password",
                get(password::reset_form).post(password::reset_password),
            ),
        Tier::Public,
        state.clone(),
    );

    let anonymous = protect(
        Router::new()
            .route("/login", get(login::login_form).post(login::login))
            .route(
                "/register",
                get(register::register_form).post(register::register),
            ),
        Tier::Anonymous,
        state.clone(),
    );

    let authenticated = protect(
        Router::new()
            .route("/verify-email-reminder", get(verification::reminder))
            .route(
                "/verify-email-reminder/resend",
                post(verification::reminder_resend),
            ),
        Tier::Authenticated,
        state.clone(),
    );

    let verified = protect(
        Router::new()
            .route("/dashboard", get(dashboard::dashboard))
            .route("/settings", get(settings::settings))
            .route("/settings/profile", post(settings::update_profile))
            .route("/settings/password", post(settings::change_password)),
        Tier::Verified,
        state.clone(),
    );

    Router::new()
        .route("/health", get(health::health).head(health::health))
        .merge(public)
        .merge(anonymous)
        .merge(authenticated)
        .merge(verified)
        .with_state(state)
}

/// Attach request ids and tracing spans.
pub fn layered(router: Router, pool: Option<PgPool>) -> Router {
    let router = router.layer(
        ServiceBuilder::new()
            .layer(SetRequestHeaderLayer::if_not_present(
                HeaderName::from_static("x-request-id"),
                |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
            ))
            .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                "x-request-id",
            )))
            .layer(TraceLayer::new_for_http().make_span_with(make_span)),
    );
    match pool {
        Some(pool) => router.layer(Extension(pool)),
        None => router,
    }
}

async fn connect(dsn: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(dsn)
        .await
        .context("Failed to connect to database")?;

    let span = info_span!("db.query", db.system = "postgresql", db.operation = "SCHEMA");
    sqlx::raw_sql(SCHEMA)
        .execute(&pool)
        .instrument(span)
        .await
        .context("Failed to apply database schema")?;
    Ok(pool)
}

/// Wire stores, the mailer and the sweeper, then serve until shutdown.
///
/// # Errors
/// Returns an error if the database is unreachable or the port cannot be bound.
pub async fn new(
    options: ServerOptions,
    auth_config: AuthConfig,
    mailer: email::Mailer,
) -> Result<()> {
    let policy = auth_config.token_policy();
    let (pool, session_store, users): (Option<PgPool>, Arc<dyn SessionStore>, Arc<dyn UserService>) =
        match options.dsn.as_deref() {
            Some(dsn) => {
                let pool = connect(dsn).await?;
                (
                    Some(pool.clone()),
                    Arc::new(PgSessionStore::new(pool.clone())),
                    Arc::new(PgUserService::new(pool, policy)),
                )
            }
            None => {
                warn!("No DSN configured, using in-memory stores; data is lost on restart");
                (
                    None,
                    Arc::new(MemorySessionStore::new()),
                    Arc::new(MemoryUserService::new(policy)),
                )
            }
        };

    sweeper::spawn_sweeper(session_store.clone(), users.clone(), options.sweep_interval);

    let sessions = Sessions::new(session_store, auth_config.session_ttl_seconds());
    let state = auth::AuthState::new(auth_config, sessions, users, mailer);
    let app = layered(router(state), pool);

    let listener = TcpListener::bind(format!("::0:{}", options.port)).await?;

    info!("Listening on [::]:{}", options.port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("Failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Gracefully shutdown");
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
