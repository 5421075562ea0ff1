//! Session and authentication core.
//!
//! This module owns session issuance and invalidation, the CSRF double-submit
//! guard, the page gates and the auth flows (register, login, logout, email
//! verification and password reset).
//!
//! ## Tokens
//!
//! Session, verification and reset tokens are 32 random bytes encoded as
//! unpadded base64url. Only SHA-256 hashes are stored. Verification and reset
//! tokens are single-use; consuming one is a single conditional update, so two
//! concurrent clicks on the same link cannot both succeed.
//!
//! ## CSRF
//!
//! Every state-changing form posts a `csrf_token` field (htmx may send the
//! `X-CSRF-Token` header instead) that must match the `clientele_csrf` cookie.
//! The token is rotated on login and registration.

pub mod csrf;
pub mod login;
pub mod middleware;
pub mod password;
pub mod redirect;
pub mod register;
pub mod session;
pub mod state;
pub mod storage;
pub mod sweeper;
pub mod token;
pub(crate) mod types;
pub(crate) mod utils;
pub mod verification;

pub use middleware::{CurrentUser, MaybeUser, Tier, protect};
pub use session::Sessions;
pub use state::{AuthConfig, AuthState, DeploymentMode, MAX_TTL_SECONDS};
pub use storage::{MemorySessionStore, PgSessionStore, SessionStore};

#[cfg(test)]
mod tests;
