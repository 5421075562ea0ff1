//! Minimal server-rendered pages.
//!
//! Real templates live with the product UI; these pages only need to carry
//! the right fields, the CSRF token and inline errors.

use axum::{
    http::{HeaderValue, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use std::fmt::Write as _;

use super::handlers::auth::{
    csrf::CsrfToken,
    state::{CSRF_FORM_FIELD, LOGIN_PATH},
};
use crate::users::User;

pub const GENERIC_ERROR: &str = "Something went wrong. Please try again.";
pub const CSRF_FAILURE: &str = "Your form expired, please try again.";

/// Escape text for HTML bodies and attribute values.
#[must_use]
pub fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Inline validation errors keyed by form field.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldErrors(Vec<(&'static str, String)>);

impl FieldErrors {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: &'static str, message: impl Into<String>) {
        if self.get(field).is_none() {
            self.0.push((field, message.into()));
        }
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, message)| message.as_str())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// An HTML page plus the CSRF cookie to (re)set when it carries a form.
pub struct Page {
    status: StatusCode,
    body: String,
    csrf_cookie: Option<HeaderValue>,
}

impl Page {
    #[must_use]
    pub fn new(status: StatusCode, title: &str, user: Option<&User>, content: &str) -> Self {
        Self {
            status,
            body: layout(title, user, content),
            csrf_cookie: None,
        }
    }

    #[must_use]
    pub fn with_csrf(mut self, csrf: &CsrfToken) -> Self {
        self.csrf_cookie = csrf.set_cookie.clone();
        self
    }
}

impl IntoResponse for Page {
    fn into_response(self) -> Response {
        let mut response = (
            self.status,
            [(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"))],
            self.body,
        )
            .into_response();
        if let Some(cookie) = self.csrf_cookie {
            response
                .headers_mut()
                .append(axum::http::header::SET_COOKIE, cookie);
        }
        response
    }
}

fn layout(title: &str, user: Option<&User>, content: &str) -> String {
    let title = escape(title);
    let nav = match user {
        Some(user) => format!(
            r#"<nav><span>{}</span> <a href="/dashboard">Dashboard</a> <a href="/settings">Settings</a></nav>"#,
            escape(&user.name)
        ),
        None => r#"<nav><a href="/login">Log in</a> <a href="/register">Sign up</a></nav>"#.to_string(),
    };
    format!(
        "<!doctype html>\n<html lang=\"en\"><head><meta charset=\"utf-8\"><title>{title} | Clientele</title><script src=\"/static/htmx.min.js\" defer></script></head><body>{nav}<main><h1>{title}</h1>{content}</main></body></html>\n"
    )
}

fn csrf_input(csrf: &CsrfToken) -> String {
    format!(
        r#"<input type="hidden" name="{CSRF_FORM_FIELD}" value="{}">"#,
        escape(&csrf.value)
    )
}

fn return_to_input(return_to: Option<&str>) -> String {
    return_to.map_or_else(String::new, |value| {
        format!(
            r#"<input type="hidden" name="return_to" value="{}">"#,
            escape(value)
        )
    })
}

fn field(
    label: &str,
    name: &'static str,
    kind: &str,
    value: &str,
    errors: &FieldErrors,
) -> String {
    let mut html = format!(
        r#"<label>{label} <input type="{kind}" name="{name}" value="{}"></label>"#,
        escape(value)
    );
    if let Some(message) = errors.get(name) {
        let _ = write!(
            html,
            r#"<p class="field-error" data-field="{name}">{}</p>"#,
            escape(message)
        );
    }
    html
}

fn notice(message: Option<&str>) -> String {
    message.map_or_else(String::new, |message| {
        format!(r#"<p class="notice">{}</p>"#, escape(message))
    })
}

fn form_error(message: Option<&str>) -> String {
    message.map_or_else(String::new, |message| {
        format!(r#"<p class="form-error" role="alert">{}</p>"#, escape(message))
    })
}

/// Values echoed back into the registration form.
#[derive(Clone, Debug, Default)]
pub struct RegisterValues {
    pub name: String,
    pub email: String,
    pub return_to: Option<String>,
}

#[must_use]
pub fn register_page(
    status: StatusCode,
    csrf: &CsrfToken,
    values: &RegisterValues,
    errors: &FieldErrors,
    invite_required: bool,
) -> Page {
    let mut content = String::from(r#"<form method="post" action="/register">"#);
    content.push_str(&csrf_input(csrf));
    content.push_str(&return_to_input(values.return_to.as_deref()));
    content.push_str(&field("Name", "name", "text", &values.name, errors));
    content.push_str(&field("Email", "email", "email", &values.email, errors));
    content.push_str(&field("Password", "password", "password", "", errors));
    content.push_str(&field(
        "Confirm password",
        "password_confirmation",
        "password",
        "",
        errors,
    ));
    if invite_required {
        content.push_str(&field("Invite code", "invite_code", "text", "", errors));
    }
    content.push_str(r#"<label><input type="checkbox" name="terms" value="on"> I accept the terms of service</label>"#);
    if let Some(message) = errors.get("terms") {
        let _ = write!(
            content,
            r#"<p class="field-error" data-field="terms">{}</p>"#,
            escape(message)
        );
    }
    content.push_str(&form_error(errors.get("form")));
    content.push_str(r#"<button type="submit">Create account</button></form>"#);
    content.push_str(r#"<p><a href="/login">Already have an account?</a></p>"#);
    Page::new(status, "Create your account", None, &content).with_csrf(csrf)
}

#[must_use]
pub fn login_page(
    status: StatusCode,
    csrf: &CsrfToken,
    email: &str,
    return_to: Option<&str>,
    error: Option<&str>,
    message: Option<&str>,
) -> Page {
    let errors = FieldErrors::new();
    let mut content = notice(message);
    content.push_str(&form_error(error));
    content.push_str(r#"<form method="post" action="/login">"#);
    content.push_str(&csrf_input(csrf));
    content.push_str(&return_to_input(return_to));
    content.push_str(&field("Email", "email", "email", email, &errors));
    content.push_str(&field("Password", "password", "password", "", &errors));
    content.push_str(r#"<button type="submit">Log in</button></form>"#);
    content.push_str(
        r#"<p><a href="/forgot-password">Forgot your password?</a> <a href="/register">Create an account</a></p>"#,
    );
    Page::new(status, "Log in", None, &content).with_csrf(csrf)
}

/// A page that states an outcome and offers links onward.
#[must_use]
pub fn message_page(
    status: StatusCode,
    title: &str,
    message: &str,
    links: &[(&str, &str)],
    user: Option<&User>,
) -> Page {
    let mut content = format!("<p>{}</p>", escape(message));
    if !links.is_empty() {
        content.push_str("<ul>");
        for (href, label) in links {
            let _ = write!(
                content,
                r#"<li><a href="{}">{}</a></li>"#,
                escape(href),
                escape(label)
            );
        }
        content.push_str("</ul>");
    }
    Page::new(status, title, user, &content)
}

#[must_use]
pub fn csrf_failure_page() -> Page {
    message_page(
        StatusCode::FORBIDDEN,
        "Form expired",
        CSRF_FAILURE,
        &[("/", "Start over")],
        None,
    )
}

#[must_use]
pub fn error_page() -> Page {
    message_page(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Error",
        GENERIC_ERROR,
        &[("/", "Home")],
        None,
    )
}

/// Email entry form shared by resend-verification and forgot-password.
#[must_use]
pub fn email_request_page(
    title: &str,
    action: &str,
    intro: &str,
    csrf: &CsrfToken,
    button: &str,
) -> Page {
    let errors = FieldErrors::new();
    let mut content = format!("<p>{}</p>", escape(intro));
    let _ = write!(content, r#"<form method="post" action="{}">"#, escape(action));
    content.push_str(&csrf_input(csrf));
    content.push_str(&field("Email", "email", "email", "", &errors));
    let _ = write!(
        content,
        r#"<button type="submit">{}</button></form>"#,
        escape(button)
    );
    Page::new(StatusCode::OK, title, None, &content).with_csrf(csrf)
}

#[must_use]
pub fn verify_reminder_page(user: &User, csrf: &CsrfToken, sent: bool) -> Page {
    let mut content = format!(
        "<p>We sent a confirmation link to <strong>{}</strong>. Open it to unlock your account.</p>",
        escape(&user.email)
    );
    if sent {
        content.push_str(&notice(Some("A new confirmation link is on its way.")));
    }
    content.push_str(r#"<form method="post" action="/verify-email-reminder/resend">"#);
    content.push_str(&csrf_input(csrf));
    content.push_str(r#"<button type="submit">Send the link again</button></form>"#);
    content.push_str(r#"<form method="post" action="/logout">"#);
    content.push_str(&csrf_input(csrf));
    content.push_str(r#"<button type="submit">Log out</button></form>"#);
    Page::new(StatusCode::OK, "Confirm your email", Some(user), &content).with_csrf(csrf)
}

#[must_use]
pub fn reset_password_page(
    status: StatusCode,
    csrf: &CsrfToken,
    token: &str,
    errors: &FieldErrors,
) -> Page {
    let mut content = String::from(r#"<form method="post" action="/reset-password">"#);
    content.push_str(&csrf_input(csrf));
    let _ = write!(
        content,
        r#"<input type="hidden" name="token" value="{}">"#,
        escape(token)
    );
    content.push_str(&field("New password", "password", "password", "", errors));
    content.push_str(&field(
        "Confirm new password",
        "password_confirmation",
        "password",
        "",
        errors,
    ));
    content.push_str(&form_error(errors.get("form")));
    content.push_str(r#"<button type="submit">Set new password</button></form>"#);
    Page::new(status, "Choose a new password", None, &content).with_csrf(csrf)
}

#[must_use]
pub fn invalid_reset_link_page() -> Page {
    message_page(
        StatusCode::BAD_REQUEST,
        "Link expired",
        "This password reset link is invalid or has expired. Please request a new reset link.",
        &[("/forgot-password", "Request a new reset link")],
        None,
    )
}

#[must_use]
pub fn dashboard_page(user: &User, csrf: &CsrfToken) -> Page {
    let mut content = format!("<p>Welcome back, {}.</p>", escape(&user.name));
    content.push_str(r#"<form method="post" action="/logout">"#);
    content.push_str(&csrf_input(csrf));
    content.push_str(r#"<button type="submit">Log out</button></form>"#);
    Page::new(StatusCode::OK, "Dashboard", Some(user), &content).with_csrf(csrf)
}

/// Values echoed back into the profile form.
#[derive(Clone, Debug, Default)]
pub struct ProfileValues {
    pub name: String,
    pub email: String,
}

#[must_use]
pub fn settings_page(
    status: StatusCode,
    user: &User,
    csrf: &CsrfToken,
    profile: &ProfileValues,
    errors: &FieldErrors,
    message: Option<&str>,
) -> Page {
    let mut content = notice(message);
    content.push_str(r#"<section><h2>Profile</h2><form method="post" action="/settings/profile">"#);
    content.push_str(&csrf_input(csrf));
    content.push_str(&field("Name", "name", "text", &profile.name, errors));
    content.push_str(&field("Email", "email", "email", &profile.email, errors));
    content.push_str(r#"<button type="submit">Save profile</button></form></section>"#);
    content.push_str(r#"<section><h2>Password</h2><form method="post" action="/settings/password">"#);
    content.push_str(&csrf_input(csrf));
    content.push_str(&field(
        "Current password",
        "current_password",
        "password",
        "",
        errors,
    ));
    content.push_str(&field("New password", "new_password", "password", "", errors));
    content.push_str(&field(
        "Confirm new password",
        "new_password_confirmation",
        "password",
        "",
        errors,
    ));
    content.push_str(&form_error(errors.get("form")));
    content.push_str(r#"<button type="submit">Change password</button></form></section>"#);
    Page::new(status, "Settings", Some(user), &content).with_csrf(csrf)
}

/// Where a logged-out visitor should go next, used by several outcome pages.
#[must_use]
pub fn login_link() -> (&'static str, &'static str) {
    (LOGIN_PATH, "Log in")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csrf() -> CsrfToken {
        CsrfToken {
            value: "csrf-value".to_string(),
            set_cookie: None,
        }
    }

    #[test]
    fn escape_neutralizes_markup() {
        assert_eq!(
            escape(r#"<script>alert("x") & 'y'</script>"#),
            "&lt;script&gt;alert(&quot;x&quot;) &amp; &#x27;y&#x27;&lt;/script&gt;"
        );
    }

    #[test]
    fn field_errors_keep_first_message() {
        let mut errors = FieldErrors::new();
        assert!(errors.is_empty());
        errors.add("email", "first");
        errors.add("email", "second");
        assert_eq!(errors.get("email"), Some("first"));
        assert_eq!(errors.get("name"), None);
    }

    #[test]
    fn register_page_renders_errors_and_csrf() {
        let mut errors = FieldErrors::new();
        errors.add("email", "Email is invalid or already in use");
        let values = RegisterValues {
            name: "<Ada>".to_string(),
            email: "ada@example.com".to_string(),
            return_to: Some("/settings".to_string()),
        };
        let page = register_page(StatusCode::UNPROCESSABLE_ENTITY, &csrf(), &values, &errors, true);
        assert_eq!(page.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(page.body.contains(r#"name="csrf_token" value="csrf-value""#));
        assert!(page.body.contains("&lt;Ada&gt;"));
        assert!(page.body.contains("Email is invalid or already in use"));
        assert!(page.body.contains(r#"name="invite_code""#));
        assert!(page.body.contains(r#"name="return_to" value="/settings""#));
    }

    #[test]
    fn page_response_sets_new_csrf_cookie() {
        let token = CsrfToken {
            value: "v".to_string(),
            set_cookie: Some(HeaderValue::from_static("clientele_csrf=v; Path=/")),
        };
        let response = login_page(StatusCode::OK, &token, "", None, None, None).into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .get(axum::http::header::SET_COOKIE)
            .is_some());
        assert_eq!(
            response.headers().get(CONTENT_TYPE),
            Some(&HeaderValue::from_static("text/html; charset=utf-8"))
        );
    }

    #[test]
    fn csrf_failure_is_forbidden() {
        let page = csrf_failure_page();
        assert_eq!(page.status, StatusCode::FORBIDDEN);
        assert!(page.body.contains(CSRF_FAILURE));
    }
}
