//! Credential validation for login.
//!
//! Unknown identifiers and wrong secrets collapse into one
//! [`CredentialError::InvalidCredentials`]. The differentiated reason only
//! goes to the security log. An unknown identifier still pays for a full
//! argon2 verification against a dummy hash so both paths take comparable time.

use std::sync::Arc;

use tracing::{error, warn};

use crate::identity::{Identity, IdentitySource};
use crate::lockout::LockoutTracker;
use crate::password::{self, PasswordError};

const DUMMY_PASSWORD: &str = "sessionward-timing-equalizer-0";

#[derive(Debug)]
pub enum CredentialError {
    /// Identifier or secret was empty
    Missing,
    /// Unknown identifier or wrong secret. `locked` is set once the
    /// identifier has crossed the failed-login threshold.
    InvalidCredentials { locked: bool },
    /// The identity source or hashing task failed
    Unavailable(String),
}

impl std::fmt::Display for CredentialError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialError::Missing => write!(f, "Email and password are required"),
            CredentialError::InvalidCredentials { .. } => write!(f, "Invalid credentials"),
            CredentialError::Unavailable(e) => write!(f, "Credential check failed: {}", e),
        }
    }
}

impl std::error::Error for CredentialError {}

pub struct CredentialValidator {
    identities: Arc<dyn IdentitySource>,
    lockout: Arc<LockoutTracker>,
    dummy_hash: String,
}

impl CredentialValidator {
    pub fn new(identities: Arc<dyn IdentitySource>, lockout: Arc<LockoutTracker>) -> Self {
        let dummy_hash = password::hash_password(DUMMY_PASSWORD).unwrap_or_else(|e| {
            error!(error = %e, "Failed to prepare dummy password hash");
            String::new()
        });
        Self {
            identities,
            lockout,
            dummy_hash,
        }
    }

    /// Check `secret` against the stored hash for `identifier`.
    pub async fn validate(&self, identifier: &str, secret: &str) -> Result<Identity, CredentialError> {
        let identifier = identifier.trim();
        if identifier.is_empty() || secret.is_empty() {
            return Err(CredentialError::Missing);
        }

        let record = self
            .identities
            .find_by_email(identifier)
            .await
            .map_err(|e| CredentialError::Unavailable(e.to_string()))?;

        let hash = match &record {
            Some(r) => r.password_hash.clone(),
            None => self.dummy_hash.clone(),
        };
        let secret = secret.to_string();
        let verified = tokio::task::spawn_blocking(move || password::verify_password(&secret, &hash))
            .await
            .map_err(|e| CredentialError::Unavailable(e.to_string()))?;

        let reason = match (&record, verified) {
            (Some(record), Ok(())) => {
                self.lockout.clear(identifier);
                return Ok(record.identity());
            }
            (None, _) => "unknown_identifier",
            (Some(_), Err(PasswordError::Mismatch)) => "wrong_secret",
            (Some(_), Err(_)) => "unreadable_hash",
        };

        let status = self.lockout.record_failure(identifier);
        warn!(
            security_event = true,
            reason,
            identifier,
            failures = status.failures,
            "Failed login attempt"
        );
        Err(CredentialError::InvalidCredentials {
            locked: status.locked,
        })
    }
}
