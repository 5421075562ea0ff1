//! Opaque token issuer for sessions, email verification and password resets.
//!
//! Tokens are 32 bytes from the OS RNG, encoded as unpadded base64url so they
//! are safe in cookies and query strings. Only SHA-256 hashes are persisted;
//! the raw value goes to the cookie or the email link and nowhere else.

use anyhow::{Context, Result};
use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};

pub const TOKEN_BYTES: usize = 32;
/// Length of an encoded token: 32 bytes as unpadded base64url.
pub const ENCODED_TOKEN_LEN: usize = 43;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Session,
    EmailVerification,
    PasswordReset,
}

impl TokenKind {
    /// Stable name used as the `purpose` column for single-use tokens.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::EmailVerification => "email_verification",
            Self::PasswordReset => "password_reset",
        }
    }

    /// Sessions are reused until they expire; the other kinds die on first use.
    #[must_use]
    pub const fn single_use(self) -> bool {
        !matches!(self, Self::Session)
    }
}

/// A freshly generated token: the raw value for the client and the hash for storage.
pub struct IssuedToken {
    pub raw: String,
    pub hash: Vec<u8>,
}

impl std::fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedToken")
            .field("raw", &"***")
            .field("hash_len", &self.hash.len())
            .finish()
    }
}

/// Generate a new token of the given kind.
///
/// # Errors
/// Returns an error if the OS random source is unavailable.
pub fn issue(kind: TokenKind) -> Result<IssuedToken> {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .with_context(|| format!("failed to generate {} token", kind.as_str()))?;
    let raw = Base64UrlUnpadded::encode_string(&bytes);
    let hash = hash_token(&raw);
    Ok(IssuedToken { raw, hash })
}

/// Hash a raw token for storage and lookups.
#[must_use]
pub fn hash_token(raw: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hasher.finalize().to_vec()
}

/// Cheap shape check so garbage never reaches storage.
#[must_use]
pub fn looks_like_token(raw: &str) -> bool {
    raw.len() == ENCODED_TOKEN_LEN
        && raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
