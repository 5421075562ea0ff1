//! Auth module tests: the page gates and flows driven through the router.

use super::csrf;
use super::state::{AuthConfig, AuthState, CSRF_COOKIE_NAME, SESSION_COOKIE_NAME};
use super::storage::MemorySessionStore;
use super::session::Sessions;
use super::token::{TokenKind, issue};
use crate::api::email::{EmailMessage, EmailSender, Mailer, MailerConfig, MemoryEmailSender};
use crate::api::router;
use crate::users::{
    NewUser, User, UserService, hashing::PasswordHashing, memory::MemoryUserService,
};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{
        HeaderMap, Request, StatusCode,
        header::{ACCEPT, CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE},
    },
    response::Response,
};
use http_body_util::BodyExt;
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const PASSWORD: &str = "password1";

struct Harness {
    app: Router,
    state: AuthState,
    users: Arc<MemoryUserService>,
    sessions: Arc<MemorySessionStore>,
    emails: Arc<MemoryEmailSender>,
    csrf: String,
}

impl Harness {
    fn new() -> Result<Self> {
        Self::with_config(AuthConfig::new("https://clientele.test".to_string()))
    }

    fn with_config(config: AuthConfig) -> Result<Self> {
        let emails = Arc::new(MemoryEmailSender::new());
        Self::build(config, emails.clone(), emails)
    }

    fn build(
        config: AuthConfig,
        sender: Arc<dyn EmailSender>,
        emails: Arc<MemoryEmailSender>,
    ) -> Result<Self> {
        let users = Arc::new(
            MemoryUserService::new(config.token_policy())
                .with_hashing(PasswordHashing::with_params(1024, 1, 1)?),
        );
        let sessions = Arc::new(MemorySessionStore::new());
        let mailer = Mailer::new(
            sender,
            MailerConfig::new(config.base_url().to_string())
                .with_timeout(Duration::from_millis(200)),
        );
        let csrf = csrf::refresh_token(&config)?.value;
        let state = AuthState::new(
            config.clone(),
            Sessions::new(sessions.clone(), config.session_ttl_seconds()),
            users.clone(),
            mailer,
        );
        Ok(Self {
            app: router(state.clone()),
            state,
            users,
            sessions,
            emails,
            csrf,
        })
    }

    async fn send(&self, request: Request<Body>) -> Result<Response> {
        Ok(self.app.clone().oneshot(request).await?)
    }

    fn csrf_cookie(&self) -> String {
        format!("{CSRF_COOKIE_NAME}={}", self.csrf)
    }

    fn cookies(&self, session: Option<&str>) -> String {
        match session {
            Some(token) => format!("{SESSION_COOKIE_NAME}={token}; {}", self.csrf_cookie()),
            None => self.csrf_cookie(),
        }
    }

    fn get(&self, uri: &str, session: Option<&str>) -> Result<Request<Body>> {
        Ok(Request::builder()
            .uri(uri)
            .header(COOKIE, self.cookies(session))
            .body(Body::empty())?)
    }

    /// POST a form carrying the harness CSRF token.
    fn post(&self, uri: &str, session: Option<&str>, pairs: &[(&str, &str)]) -> Result<Request<Body>> {
        let mut pairs = pairs.to_vec();
        pairs.push(("csrf_token", self.csrf.as_str()));
        self.post_raw(uri, &self.cookies(session), &pairs)
    }

    fn post_raw(&self, uri: &str, cookies: &str, pairs: &[(&str, &str)]) -> Result<Request<Body>> {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        Ok(Request::builder()
            .method("POST")
            .uri(uri)
            .header(COOKIE, cookies)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body))?)
    }

    async fn register_user(&self, email: &str, verified: bool) -> Result<User> {
        let user = self
            .users
            .register(NewUser {
                name: "Ada".to_string(),
                email: email.to_string(),
                password: SecretString::from(PASSWORD),
            })
            .await?;
        if verified {
            self.users.mark_verified(user.id).await?;
        }
        Ok(self.users.get_by_id(user.id).await?)
    }

    async fn session_for(&self, user: &User) -> Result<String> {
        self.state.sessions().create_session(user.id).await
    }

    async fn resolves(&self, token: &str) -> Result<bool> {
        Ok(self
            .state
            .sessions()
            .resolve_session(token, self.state.users())
            .await?
            .is_some())
    }

    /// Wait for detached email tasks to deliver `count` messages.
    async fn wait_for_emails(&self, count: usize) -> Vec<EmailMessage> {
        for _ in 0..100 {
            let messages = self.emails.messages().await;
            if messages.len() >= count {
                return messages;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.emails.messages().await
    }
}

fn location(response: &Response) -> Option<&str> {
    response
        .headers()
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
}

fn set_cookies(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(ToString::to_string)
        .collect()
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let prefix = format!("{name}=");
    set_cookies(headers).into_iter().find_map(|cookie| {
        cookie
            .strip_prefix(&prefix)
            .and_then(|rest| rest.split(';').next())
            .map(ToString::to_string)
    })
}

async fn body_text(response: Response) -> Result<String> {
    let bytes = response.into_body().collect().await?.to_bytes();
    String::from_utf8(bytes.to_vec()).context("body is not utf-8")
}

fn token_from_link(message: &EmailMessage) -> Result<String> {
    message
        .action_url
        .split("token=")
        .nth(1)
        .map(ToString::to_string)
        .ok_or_else(|| anyhow!("no token in {}", message.action_url))
}

// Gates

#[tokio::test]
async fn anonymous_visitor_is_sent_to_login_with_return_to() -> Result<()> {
    let harness = Harness::new()?;
    let response = harness.send(harness.get("/dashboard", None)?).await?;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), Some("/login?return_to=%2Fdashboard"));
    Ok(())
}

#[tokio::test]
async fn return_to_with_a_query_survives_the_login_redirect() -> Result<()> {
    let harness = Harness::new()?;
    let response = harness.send(harness.get("/settings?saved=1", None)?).await?;
    let target = location(&response)
        .ok_or_else(|| anyhow!("missing location"))?
        .to_string();
    assert_eq!(target, "/login?return_to=%2Fsettings%3Fsaved%3D1");

    let response = harness.send(harness.get(&target, None)?).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_text(response)
        .await?
        .contains(r#"name="return_to" value="/settings?saved=1""#));
    Ok(())
}

#[tokio::test]
async fn json_client_gets_401_instead_of_redirect() -> Result<()> {
    let harness = Harness::new()?;
    let request = Request::builder()
        .uri("/settings")
        .header(ACCEPT, "application/json")
        .body(Body::empty())?;
    let response = harness.send(request).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = serde_json::from_str(&body_text(response).await?)?;
    assert_eq!(body["error"], "unauthorized");
    Ok(())
}

#[tokio::test]
async fn htmx_client_gets_hx_redirect() -> Result<()> {
    let harness = Harness::new()?;
    let request = Request::builder()
        .uri("/dashboard")
        .header("HX-Request", "true")
        .body(Body::empty())?;
    let response = harness.send(request).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("hx-redirect")
            .and_then(|value| value.to_str().ok()),
        Some("/login?return_to=%2Fdashboard")
    );
    Ok(())
}

#[tokio::test]
async fn unverified_and_verified_users_never_loop() -> Result<()> {
    let harness = Harness::new()?;
    let unverified = harness.register_user("new@example.com", false).await?;
    let token = harness.session_for(&unverified).await?;

    let response = harness.send(harness.get("/dashboard", Some(&token))?).await?;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), Some("/verify-email-reminder"));

    let response = harness
        .send(harness.get("/verify-email-reminder", Some(&token))?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let verified = harness.register_user("old@example.com", true).await?;
    let token = harness.session_for(&verified).await?;
    let response = harness
        .send(harness.get("/verify-email-reminder", Some(&token))?)
        .await?;
    assert_eq!(location(&response), Some("/dashboard"));
    let response = harness.send(harness.get("/dashboard", Some(&token))?).await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn unverified_json_client_gets_403() -> Result<()> {
    let harness = Harness::new()?;
    let user = harness.register_user("new@example.com", false).await?;
    let token = harness.session_for(&user).await?;
    let request = Request::builder()
        .uri("/dashboard")
        .header(COOKIE, harness.cookies(Some(&token)))
        .header(ACCEPT, "application/json")
        .body(Body::empty())?;
    let response = harness.send(request).await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body: serde_json::Value = serde_json::from_str(&body_text(response).await?)?;
    assert_eq!(body["error"], "email_not_verified");
    Ok(())
}

#[tokio::test]
async fn signed_in_user_skips_login_and_register() -> Result<()> {
    let harness = Harness::new()?;
    let user = harness.register_user("ada@example.com", true).await?;
    let token = harness.session_for(&user).await?;
    for path in ["/login", "/register"] {
        let response = harness.send(harness.get(path, Some(&token))?).await?;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), Some("/dashboard"));
    }
    Ok(())
}

#[tokio::test]
async fn expired_or_garbage_session_is_anonymous() -> Result<()> {
    let harness = Harness::new()?;
    let user = harness.register_user("ada@example.com", true).await?;
    let token = harness.session_for(&user).await?;
    harness.sessions.expire_all().await;

    let response = harness.send(harness.get("/dashboard", Some(&token))?).await?;
    assert_eq!(location(&response), Some("/login?return_to=%2Fdashboard"));
    let response = harness
        .send(harness.get("/dashboard", Some("not-a-real-token"))?)
        .await?;
    assert_eq!(location(&response), Some("/login?return_to=%2Fdashboard"));
    Ok(())
}

#[tokio::test]
async fn every_form_render_refreshes_the_csrf_cookie() -> Result<()> {
    let harness = Harness::new()?;
    let user = harness.register_user("ada@example.com", true).await?;
    let token = harness.session_for(&user).await?;

    let pages = [
        ("/login", None),
        ("/register", None),
        ("/forgot-password", None),
        ("/settings", Some(token.as_str())),
    ];
    for (path, session) in pages {
        let response = harness.send(harness.get(path, session)?).await?;
        assert_eq!(response.status(), StatusCode::OK, "{path}");
        let cookie = set_cookies(response.headers())
            .into_iter()
            .find(|cookie| cookie.starts_with(&format!("{CSRF_COOKIE_NAME}=")))
            .ok_or_else(|| anyhow!("{path} did not refresh the csrf cookie"))?;
        assert!(cookie.starts_with(&format!("{};", harness.csrf_cookie())), "{path}");
        assert!(cookie.contains("Max-Age=3600"), "{path}");
    }
    Ok(())
}

// Register

#[tokio::test]
async fn register_signs_in_and_sends_verification() -> Result<()> {
    let harness = Harness::new()?;
    let response = harness
        .send(harness.post(
            "/register",
            None,
            &[
                ("name", "Ada"),
                ("email", " Ada@Example.com "),
                ("password", PASSWORD),
                ("password_confirmation", PASSWORD),
                ("terms", "on"),
                ("return_to", "/settings"),
            ],
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), Some("/settings"));

    let session = cookie_value(response.headers(), SESSION_COOKIE_NAME)
        .ok_or_else(|| anyhow!("missing session cookie"))?;
    let rotated = cookie_value(response.headers(), CSRF_COOKIE_NAME)
        .ok_or_else(|| anyhow!("missing csrf cookie"))?;
    assert_ne!(rotated, harness.csrf);
    assert!(harness.resolves(&session).await?);

    let messages = harness.wait_for_emails(1).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].to_email, "ada@example.com");
    assert!(messages[0].action_url.starts_with("https://clientele.test/verify-email?token="));
    Ok(())
}

#[tokio::test]
async fn register_without_csrf_creates_nothing() -> Result<()> {
    let harness = Harness::new()?;
    let response = harness
        .send(harness.post_raw(
            "/register",
            "",
            &[
                ("name", "Ada"),
                ("email", "ada@example.com"),
                ("password", PASSWORD),
                ("password_confirmation", PASSWORD),
                ("terms", "on"),
            ],
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(cookie_value(response.headers(), SESSION_COOKIE_NAME).is_none());
    assert!(body_text(response).await?.contains("Your form expired"));
    assert!(harness
        .users
        .create_password_reset_token("ada@example.com")
        .await?
        .is_none());
    Ok(())
}

#[tokio::test]
async fn register_conflict_uses_format_error_text() -> Result<()> {
    let harness = Harness::new()?;
    harness.register_user("ada@example.com", false).await?;
    let form = |email: &'static str| {
        [
            ("name", "Ada"),
            ("email", email),
            ("password", PASSWORD),
            ("password_confirmation", PASSWORD),
            ("terms", "on"),
        ]
    };

    let taken = harness
        .send(harness.post("/register", None, &form("ada@example.com"))?)
        .await?;
    assert_eq!(taken.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let malformed = harness
        .send(harness.post("/register", None, &form("ada-at-example"))?)
        .await?;
    assert_eq!(malformed.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let message = super::register::EMAIL_ERROR;
    assert!(body_text(taken).await?.contains(message));
    assert!(body_text(malformed).await?.contains(message));
    Ok(())
}

#[tokio::test]
async fn register_requires_invite_code_when_configured() -> Result<()> {
    let harness = Harness::with_config(
        AuthConfig::new("https://clientele.test".to_string())
            .with_invite_code(Some("friends".to_string())),
    )?;
    let mut form = vec![
        ("name", "Ada"),
        ("email", "ada@example.com"),
        ("password", PASSWORD),
        ("password_confirmation", PASSWORD),
        ("terms", "on"),
        ("invite_code", "strangers"),
    ];
    let response = harness.send(harness.post("/register", None, &form)?).await?;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    form.pop();
    form.push(("invite_code", "friends"));
    let response = harness.send(harness.post("/register", None, &form)?).await?;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    Ok(())
}

struct BrokenSender;

#[async_trait]
impl EmailSender for BrokenSender {
    async fn send(&self, _message: &EmailMessage) -> Result<()> {
        Err(anyhow!("smtp unavailable"))
    }
}

#[tokio::test]
async fn email_failure_does_not_change_the_response() -> Result<()> {
    let harness = Harness::build(
        AuthConfig::new("https://clientele.test".to_string()),
        Arc::new(BrokenSender),
        Arc::new(MemoryEmailSender::new()),
    )?;
    let response = harness
        .send(harness.post(
            "/register",
            None,
            &[
                ("name", "Ada"),
                ("email", "ada@example.com"),
                ("password", PASSWORD),
                ("password_confirmation", PASSWORD),
                ("terms", "on"),
            ],
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), Some("/dashboard"));
    Ok(())
}

// Login / logout

#[tokio::test]
async fn login_failures_are_byte_identical() -> Result<()> {
    let with_user = Harness::new()?;
    with_user.register_user("ada@example.com", true).await?;
    let mut without_user = Harness::new()?;
    without_user.csrf = with_user.csrf.clone();

    let form = [("email", "ada@example.com"), ("password", "wrong-password")];
    let first = with_user.send(with_user.post("/login", None, &form)?).await?;
    let second = without_user
        .send(without_user.post("/login", None, &form)?)
        .await?;

    assert_eq!(first.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(first.status(), second.status());
    assert_eq!(set_cookies(first.headers()), set_cookies(second.headers()));
    let first = body_text(first).await?;
    assert_eq!(first, body_text(second).await?);
    assert!(first.contains(super::login::INVALID_CREDENTIALS));
    Ok(())
}

#[tokio::test]
async fn login_honours_safe_return_to_only() -> Result<()> {
    let harness = Harness::new()?;
    harness.register_user("ada@example.com", true).await?;

    let response = harness
        .send(harness.post(
            "/login",
            None,
            &[
                ("email", "ADA@example.com"),
                ("password", PASSWORD),
                ("return_to", "/settings"),
            ],
        )?)
        .await?;
    assert_eq!(location(&response), Some("/settings"));
    let session = cookie_value(response.headers(), SESSION_COOKIE_NAME)
        .ok_or_else(|| anyhow!("missing session cookie"))?;
    assert!(harness.resolves(&session).await?);

    let response = harness
        .send(harness.post(
            "/login",
            None,
            &[
                ("email", "ada@example.com"),
                ("password", PASSWORD),
                ("return_to", "//evil.example"),
            ],
        )?)
        .await?;
    assert_eq!(location(&response), Some("/dashboard"));
    Ok(())
}

#[tokio::test]
async fn logout_invalidates_and_clears_cookie() -> Result<()> {
    let harness = Harness::new()?;
    let user = harness.register_user("ada@example.com", true).await?;
    let token = harness.session_for(&user).await?;

    let response = harness.send(harness.post("/logout", Some(&token), &[])?).await?;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), Some("/login"));
    assert!(set_cookies(response.headers())
        .iter()
        .any(|cookie| cookie.starts_with("clientele_session=;") && cookie.contains("Max-Age=0")));
    assert!(!harness.resolves(&token).await?);

    // Without a session it still succeeds.
    let response = harness.send(harness.post("/logout", None, &[])?).await?;
    assert_eq!(location(&response), Some("/login"));
    Ok(())
}

#[tokio::test]
async fn logout_without_csrf_clears_cookie_but_keeps_server_session() -> Result<()> {
    let harness = Harness::new()?;
    let user = harness.register_user("ada@example.com", true).await?;
    let token = harness.session_for(&user).await?;
    let cookies = format!("{SESSION_COOKIE_NAME}={token}; {}", harness.csrf_cookie());

    let response = harness.send(harness.post_raw("/logout", &cookies, &[])?).await?;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), Some("/login"));
    assert!(set_cookies(response.headers())
        .iter()
        .any(|cookie| cookie.starts_with("clientele_session=;") && cookie.contains("Max-Age=0")));
    assert!(harness.resolves(&token).await?);

    // A wrong token behaves the same way.
    let response = harness
        .send(harness.post_raw("/logout", &cookies, &[("csrf_token", "forged")])?)
        .await?;
    assert_eq!(location(&response), Some("/login"));
    assert!(harness.resolves(&token).await?);
    Ok(())
}

#[tokio::test]
async fn htmx_logout_uses_csrf_header() -> Result<()> {
    let harness = Harness::new()?;
    let user = harness.register_user("ada@example.com", true).await?;
    let token = harness.session_for(&user).await?;
    let request = Request::builder()
        .method("POST")
        .uri("/logout")
        .header(COOKIE, harness.cookies(Some(&token)))
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .header("HX-Request", "true")
        .header("X-CSRF-Token", harness.csrf.as_str())
        .body(Body::empty())?;
    let response = harness.send(request).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("hx-redirect")
            .and_then(|value| value.to_str().ok()),
        Some("/login")
    );
    assert!(!harness.resolves(&token).await?);
    Ok(())
}

// Verification

#[tokio::test]
async fn verification_link_works_once_then_reports_already_verified() -> Result<()> {
    let harness = Harness::new()?;
    let user = harness.register_user("ada@example.com", false).await?;
    let token = harness.users.create_email_verification_token(user.id).await?;
    let uri = format!("/verify-email?token={token}");

    let response = harness.send(harness.get(&uri, None)?).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_text(response).await?.contains("is verified"));

    let response = harness.send(harness.get(&uri, None)?).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_text(response).await?.contains("already verified"));
    assert!(harness.users.get_by_id(user.id).await?.email_verified);
    Ok(())
}

#[tokio::test]
async fn bad_or_expired_verification_links_are_400() -> Result<()> {
    let harness = Harness::new()?;
    let user = harness.register_user("ada@example.com", false).await?;
    let token = harness.users.create_email_verification_token(user.id).await?;
    harness.users.expire_all_tokens().await;

    let unknown = issue(TokenKind::EmailVerification)?.raw;
    for uri in [
        "/verify-email".to_string(),
        "/verify-email?token=abc".to_string(),
        format!("/verify-email?token={unknown}"),
        format!("/verify-email?token={token}"),
    ] {
        let response = harness.send(harness.get(&uri, None)?).await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
        assert!(body_text(response).await?.contains("/resend-verification"));
    }
    Ok(())
}

#[tokio::test]
async fn resend_is_indistinguishable() -> Result<()> {
    let harness = Harness::new()?;
    harness.register_user("ada@example.com", false).await?;
    harness.register_user("done@example.com", true).await?;

    let mut bodies = Vec::new();
    for email in ["ada@example.com", "nobody@example.com", "done@example.com", "nonsense"] {
        let response = harness
            .send(harness.post("/resend-verification", None, &[("email", email)])?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        bodies.push(body_text(response).await?);
    }
    assert!(bodies.windows(2).all(|pair| pair[0] == pair[1]));
    assert!(bodies[0].contains(super::verification::RESEND_SENT));

    let messages = harness.wait_for_emails(1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(harness.emails.messages().await.len(), 1);
    assert_eq!(messages[0].to_email, "ada@example.com");
    Ok(())
}

#[tokio::test]
async fn reminder_resend_redirects_with_sent_flag() -> Result<()> {
    let harness = Harness::new()?;
    let user = harness.register_user("ada@example.com", false).await?;
    let token = harness.session_for(&user).await?;
    let response = harness
        .send(harness.post("/verify-email-reminder/resend", Some(&token), &[])?)
        .await?;
    assert_eq!(location(&response), Some("/verify-email-reminder?sent=1"));
    assert_eq!(harness.wait_for_emails(1).await.len(), 1);
    assert_eq!(
        harness
            .users
            .live_tokens(user.id, TokenKind::EmailVerification)
            .await,
        1
    );
    Ok(())
}

// Password reset

#[tokio::test]
async fn forgot_password_is_indistinguishable() -> Result<()> {
    let harness = Harness::new()?;
    harness.register_user("ada@example.com", true).await?;

    let known = harness
        .send(harness.post("/forgot-password", None, &[("email", "ada@example.com")])?)
        .await?;
    let unknown = harness
        .send(harness.post("/forgot-password", None, &[("email", "eve@example.com")])?)
        .await?;
    assert_eq!(known.status(), unknown.status());
    assert_eq!(body_text(known).await?, body_text(unknown).await?);

    let messages = harness.wait_for_emails(1).await;
    assert_eq!(messages.len(), 1);
    assert!(messages[0].action_url.contains("/reset-password?token="));
    Ok(())
}

#[tokio::test]
async fn reset_password_consumes_token_and_kills_sessions() -> Result<()> {
    let harness = Harness::new()?;
    let user = harness.register_user("ada@example.com", true).await?;
    let first = harness.session_for(&user).await?;
    let second = harness.session_for(&user).await?;
    let issued = harness
        .users
        .create_password_reset_token("ada@example.com")
        .await?
        .ok_or_else(|| anyhow!("no reset token"))?;

    let response = harness
        .send(harness.get(&format!("/reset-password?token={}", issued.token), None)?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_text(response).await?.contains(r#"name="token""#));

    let short = harness
        .send(harness.post(
            "/reset-password",
            Some(&first),
            &[
                ("token", issued.token.as_str()),
                ("password", "short"),
                ("password_confirmation", "short"),
            ],
        )?)
        .await?;
    assert_eq!(short.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let form = [
        ("token", issued.token.as_str()),
        ("password", "brand-new-password"),
        ("password_confirmation", "brand-new-password"),
    ];
    let response = harness
        .send(harness.post("/reset-password", Some(&first), &form)?)
        .await?;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), Some("/login?reset=1"));
    assert!(set_cookies(response.headers())
        .iter()
        .any(|cookie| cookie.starts_with("clientele_session=;")));
    assert!(!harness.resolves(&first).await?);
    assert!(!harness.resolves(&second).await?);

    let replay = harness.send(harness.post("/reset-password", None, &form)?).await?;
    assert_eq!(replay.status(), StatusCode::BAD_REQUEST);
    let response = harness
        .send(harness.get(&format!("/reset-password?token={}", issued.token), None)?)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

// Settings

#[tokio::test]
async fn password_change_signs_out_everywhere() -> Result<()> {
    let harness = Harness::new()?;
    let user = harness.register_user("ada@example.com", true).await?;
    let current = harness.session_for(&user).await?;
    let other = harness.session_for(&user).await?;

    let wrong = harness
        .send(harness.post(
            "/settings/password",
            Some(&current),
            &[
                ("current_password", "not-my-password"),
                ("new_password", "another-password"),
                ("new_password_confirmation", "another-password"),
            ],
        )?)
        .await?;
    assert_eq!(wrong.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert!(harness.resolves(&other).await?);

    let response = harness
        .send(harness.post(
            "/settings/password",
            Some(&current),
            &[
                ("current_password", PASSWORD),
                ("new_password", "another-password"),
                ("new_password_confirmation", "another-password"),
            ],
        )?)
        .await?;
    assert_eq!(location(&response), Some("/login?password_changed=1"));
    assert!(!harness.resolves(&current).await?);
    assert!(!harness.resolves(&other).await?);
    assert_eq!(harness.sessions.count_for_user(user.id).await, 0);
    Ok(())
}

#[tokio::test]
async fn email_change_requires_new_verification() -> Result<()> {
    let harness = Harness::new()?;
    let user = harness.register_user("ada@example.com", true).await?;
    let token = harness.session_for(&user).await?;

    let response = harness
        .send(harness.post(
            "/settings/profile",
            Some(&token),
            &[("name", "Ada L"), ("email", "ada.l@example.com")],
        )?)
        .await?;
    assert_eq!(location(&response), Some("/verify-email-reminder?sent=1"));
    let updated = harness.users.get_by_id(user.id).await?;
    assert!(!updated.email_verified);
    assert_eq!(updated.email, "ada.l@example.com");

    let messages = harness.wait_for_emails(1).await;
    assert_eq!(messages.len(), 1);
    let link_token = token_from_link(&messages[0])?;
    let response = harness
        .send(harness.get(&format!("/verify-email?token={link_token}"), None)?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn old_address_links_stop_working_after_email_change() -> Result<()> {
    let harness = Harness::new()?;
    let user = harness.register_user("ada@example.com", false).await?;
    let first = harness.users.create_email_verification_token(user.id).await?;
    let second = harness.users.create_email_verification_token(user.id).await?;

    let response = harness
        .send(harness.get(&format!("/verify-email?token={first}"), None)?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let token = harness.session_for(&user).await?;
    let response = harness
        .send(harness.post(
            "/settings/profile",
            Some(&token),
            &[("name", "Ada"), ("email", "attacker@example.com")],
        )?)
        .await?;
    assert_eq!(location(&response), Some("/verify-email-reminder?sent=1"));

    let response = harness
        .send(harness.get(&format!("/verify-email?token={second}"), None)?)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_text(response).await?.contains("/resend-verification"));
    assert!(!harness.users.get_by_id(user.id).await?.email_verified);
    Ok(())
}
