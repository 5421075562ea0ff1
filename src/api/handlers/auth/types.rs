//! Form payloads for the auth pages.
//!
//! Every field defaults so a partial submission still reaches validation
//! (and the CSRF check) instead of being rejected by the extractor. Password
//! fields are redacted from `Debug` output.

use serde::Deserialize;
use std::fmt;

#[derive(Default, Deserialize)]
#[serde(default)]
pub struct RegisterForm {
    pub name: String,
    pub email: String,
    pub password: String,
    pub password_confirmation: String,
    pub terms: Option<String>,
    pub invite_code: Option<String>,
    pub csrf_token: Option<String>,
    pub return_to: Option<String>,
}

impl fmt::Debug for RegisterForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterForm")
            .field("name", &self.name)
            .field("email", &self.email)
            .field("password", &"***")
            .field("password_confirmation", &"***")
            .field("terms", &self.terms)
            .field("invite_code", &self.invite_code.as_ref().map(|_| "***"))
            .field("return_to", &self.return_to)
            .finish_non_exhaustive()
    }
}

#[derive(Default, Deserialize)]
#[serde(default)]
pub struct LoginForm {
    pub email: String,
    pub password: String,
    pub csrf_token: Option<String>,
    pub return_to: Option<String>,
}

impl fmt::Debug for LoginForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginForm")
            .field("email", &self.email)
            .field("password", &"***")
            .field("return_to", &self.return_to)
            .finish_non_exhaustive()
    }
}

/// Query string of the login page.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LoginQuery {
    pub return_to: Option<String>,
    pub reset: Option<String>,
    pub password_changed: Option<String>,
    pub verified: Option<String>,
}

/// Forms that carry nothing but the CSRF token (logout, reminder resend).
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CsrfForm {
    pub csrf_token: Option<String>,
}

/// Email-only forms: resend verification and forgot password.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct EmailForm {
    pub email: String,
    pub csrf_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TokenQuery {
    pub token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SentQuery {
    pub sent: Option<String>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
pub struct ResetPasswordForm {
    pub token: String,
    pub password: String,
    pub password_confirmation: String,
    pub csrf_token: Option<String>,
}

impl fmt::Debug for ResetPasswordForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResetPasswordForm")
            .field("token", &"***")
            .field("password", &"***")
            .field("password_confirmation", &"***")
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ProfileForm {
    pub name: String,
    pub email: String,
    pub csrf_token: Option<String>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
pub struct ChangePasswordForm {
    pub current_password: String,
    pub new_password: String,
    pub new_password_confirmation: String,
    pub csrf_token: Option<String>,
}

impl fmt::Debug for ChangePasswordForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangePasswordForm")
            .field("current_password", &"***")
            .field("new_password", &"***")
            .field("new_password_confirmation", &"***")
            .finish_non_exhaustive()
    }
}
