//! Exchanging a refresh token for a new access token.
//!
//! A presented token moves through
//! `Presented -> SignatureVerified -> StoreValidated -> AccessReissued`, or
//! stops in `Rejected`. The refresh token is not rotated: the same token keeps
//! working until it expires or the session is removed by logout.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::db::{StoreError, TokenStore};
use crate::identity::{Identity, IdentitySource};
use crate::jwt::{JwtError, TokenIssuer};

/// Stages a presented refresh token passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshStage {
    Presented,
    SignatureVerified,
    StoreValidated,
    AccessReissued,
    Rejected,
}

#[derive(Debug)]
pub enum RefreshRejection {
    /// No token was presented
    NoToken,
    /// Bad signature, malformed, or past its `exp`
    InvalidToken,
    /// No valid, unexpired session row matches the token and its user
    InvalidOrExpired,
    /// The session store could not answer
    Store(StoreError),
    /// The identity lookup failed
    Identity(String),
    /// A new access token could not be signed
    Issuance(JwtError),
}

impl RefreshRejection {
    /// Stage the token had reached when it was rejected.
    pub fn stage(&self) -> RefreshStage {
        match self {
            RefreshRejection::NoToken => RefreshStage::Presented,
            RefreshRejection::InvalidToken => RefreshStage::Presented,
            RefreshRejection::InvalidOrExpired | RefreshRejection::Store(_) => {
                RefreshStage::SignatureVerified
            }
            RefreshRejection::Identity(_) | RefreshRejection::Issuance(_) => {
                RefreshStage::StoreValidated
            }
        }
    }
}

impl std::fmt::Display for RefreshRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefreshRejection::NoToken => write!(f, "Refresh token not provided"),
            RefreshRejection::InvalidToken => write!(f, "Invalid refresh token"),
            RefreshRejection::InvalidOrExpired => write!(f, "Invalid or expired refresh token"),
            RefreshRejection::Store(e) => write!(f, "{}", e),
            RefreshRejection::Identity(e) => write!(f, "Identity lookup failed: {}", e),
            RefreshRejection::Issuance(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for RefreshRejection {}

/// Result of a successful refresh.
#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    pub access_token: String,
    pub identity: Identity,
}

pub struct RefreshRotationProtocol {
    issuer: Arc<TokenIssuer>,
    tokens: TokenStore,
    identities: Arc<dyn IdentitySource>,
}

impl RefreshRotationProtocol {
    pub fn new(
        issuer: Arc<TokenIssuer>,
        tokens: TokenStore,
        identities: Arc<dyn IdentitySource>,
    ) -> Self {
        Self {
            issuer,
            tokens,
            identities,
        }
    }

    /// Run a presented refresh token through every stage.
    pub async fn refresh(&self, presented: Option<&str>) -> Result<RefreshOutcome, RefreshRejection> {
        // Presented
        let token = presented
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(RefreshRejection::NoToken)?;

        // SignatureVerified
        let claims = self.issuer.validate_refresh(token).map_err(|e| {
            warn!(security_event = true, error = %e, "Refresh token failed verification");
            RefreshRejection::InvalidToken
        })?;
        debug!(user_id = %claims.sub, stage = ?RefreshStage::SignatureVerified, "Refresh token verified");

        // StoreValidated. A miss leaves the row alone so a retry with the right token still works.
        let session = self
            .tokens
            .find_active_session(token, &claims.sub)
            .await
            .map_err(|e| {
                error!(user_id = %claims.sub, error = %e, "Failed to look up session");
                RefreshRejection::Store(e)
            })?;
        if session.is_none() {
            warn!(
                security_event = true,
                user_id = %claims.sub,
                "Refresh token has no active session"
            );
            return Err(RefreshRejection::InvalidOrExpired);
        }

        // Read from the source, not the verification cache
        let identity = match self.identities.find_by_id(&claims.sub).await {
            Ok(Some(identity)) => identity,
            Ok(None) => {
                warn!(user_id = %claims.sub, "Refresh token belongs to a deleted identity");
                return Err(RefreshRejection::InvalidOrExpired);
            }
            Err(e) => {
                error!(user_id = %claims.sub, error = %e, "Failed to load identity for refresh");
                return Err(RefreshRejection::Identity(e.to_string()));
            }
        };

        // AccessReissued
        let access_token = self
            .issuer
            .issue_access(&identity)
            .map_err(RefreshRejection::Issuance)?;
        debug!(user_id = %identity.id, stage = ?RefreshStage::AccessReissued, "Access token reissued");

        Ok(RefreshOutcome {
            access_token,
            identity,
        })
    }
}
