//! Argon2id password hashing.
//!
//! Hashing is CPU bound, so both operations run on the blocking pool. Unknown
//! accounts are checked against a dummy hash produced with the same parameters
//! so a failed login costs the same whether or not the email exists.

use anyhow::{Context, Result, anyhow};
use argon2::{
    Algorithm, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier, Version,
    password_hash::{SaltString, rand_core::OsRng},
};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::OnceCell;

#[derive(Debug)]
pub struct PasswordHashing {
    params: Params,
    dummy_hash: OnceCell<String>,
}

impl PasswordHashing {
    /// Argon2id with explicit cost parameters (memory in KiB).
    ///
    /// # Errors
    /// Returns an error if the parameters are out of range for Argon2.
    pub fn with_params(m_cost: u32, t_cost: u32, p_cost: u32) -> Result<Self> {
        let params = Params::new(m_cost, t_cost, p_cost, None)
            .map_err(|err| anyhow!("invalid argon2 parameters: {err}"))?;
        Ok(Self {
            params,
            dummy_hash: OnceCell::new(),
        })
    }

    fn argon2(params: Params) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
    }

    /// Hash a password into a PHC string.
    ///
    /// # Errors
    /// Returns an error if hashing fails or the blocking task panics.
    pub async fn hash(&self, password: &SecretString) -> Result<String> {
        let params = self.params.clone();
        let password = SecretString::from(password.expose_secret());
        tokio::task::spawn_blocking(move || {
            let salt = SaltString::generate(&mut OsRng);
            Self::argon2(params)
                .hash_password(password.expose_secret().as_bytes(), &salt)
                .map(|hash| hash.to_string())
                .map_err(|err| anyhow!("failed to hash password: {err}"))
        })
        .await
        .context("password hashing task failed")?
    }

    /// Verify a password against a stored PHC string. With `None`, a dummy
    /// hash is checked instead and the result is always `false`.
    ///
    /// # Errors
    /// Returns an error if the stored hash cannot be parsed or the task panics.
    pub async fn verify(&self, password: &SecretString, stored: Option<String>) -> Result<bool> {
        let (phc, known) = match stored {
            Some(phc) => (phc, true),
            None => (self.dummy_hash().await?, false),
        };
        let password = SecretString::from(password.expose_secret());
        let matched = tokio::task::spawn_blocking(move || -> Result<bool> {
            let parsed =
                PasswordHash::new(&phc).map_err(|err| anyhow!("invalid password hash: {err}"))?;
            Ok(Argon2::default()
                .verify_password(password.expose_secret().as_bytes(), &parsed)
                .is_ok())
        })
        .await
        .context("password verification task failed")??;
        Ok(known && matched)
    }

    async fn dummy_hash(&self) -> Result<String> {
        let hash = self
            .dummy_hash
            .get_or_try_init(|| async {
                self.hash(&SecretString::from("clientele-dummy-password"))
                    .await
            })
            .await?;
        Ok(hash.clone())
    }
}

impl Default for PasswordHashing {
    fn default() -> Self {
        Self {
            params: Params::default(),
            dummy_hash: OnceCell::new(),
        }
    }
}
