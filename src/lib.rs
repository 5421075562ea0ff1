//! # Clientele (accounts, sessions and billing for small businesses)
//!
//! `clientele` is a server-rendered web application. This crate holds the
//! account core: session issuance and invalidation, email verification and
//! password reset token flows, CSRF double-submit protection and the
//! middleware gates that decide who may see which page.
//!
//! ## Sessions
//!
//! The session cookie carries only an opaque 256-bit token. The database stores
//! a SHA-256 hash of it, so a leaked table cannot be replayed as cookies.
//! Changing or resetting a password deletes every session of that user before
//! the response is sent.
//!
//! ## Page tiers
//!
//! Every route belongs to exactly one tier:
//!
//! - **Public:** health, logout, verification links, password reset.
//! - **Anonymous:** login and registration; signed-in users are sent to the dashboard.
//! - **Authenticated:** the verification reminder; unverified users land here.
//! - **Verified:** everything else (dashboard, settings, clients, billing).
//!
//! Unverified users are redirected to the reminder page instead of the login
//! page, and the reminder is never placed behind the verified gate, so no
//! redirect loop can form.
//!
//! ## Enumeration resistance
//!
//! Login failures, password reset requests and verification resends return the
//! same response whether or not an account exists for the submitted address.

pub mod api;
pub mod cli;
pub mod users;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
