//! Identity source contract.
//!
//! The session core only reads identity projections; the identity rows
//! themselves belong to whatever implements [`IdentitySource`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Public projection of an identity. This is what tokens and responses carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub email: String,
}

/// Identity row including the stored password hash.
/// Only the credential validator ever sees this shape.
#[derive(Debug, Clone)]
pub struct IdentityRecord {
    pub id: String,
    pub email: String,
    pub password_hash: String,
}

impl IdentityRecord {
    pub fn identity(&self) -> Identity {
        Identity {
            id: self.id.clone(),
            email: self.email.clone(),
        }
    }
}

/// Errors reported by identity collaborators.
#[derive(Debug)]
pub enum IdentityError {
    /// An identity with this identifier already exists
    Conflict,
    /// The backing source failed
    Unavailable(String),
}

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityError::Conflict => write!(f, "Identity already exists"),
            IdentityError::Unavailable(e) => write!(f, "Identity source unavailable: {}", e),
        }
    }
}

impl std::error::Error for IdentityError {}

/// Lookup-by-identifier and lookup-by-id over the identity store.
#[async_trait]
pub trait IdentitySource: Send + Sync {
    /// Find the identity and its password hash by email (case-insensitive).
    async fn find_by_email(&self, email: &str) -> Result<Option<IdentityRecord>, IdentityError>;

    /// Find the public projection by identity ID.
    async fn find_by_id(&self, id: &str) -> Result<Option<Identity>, IdentityError>;

    /// Create a new identity with an already-hashed password.
    async fn create(&self, email: &str, password_hash: &str) -> Result<Identity, IdentityError>;
}

/// Downstream hook called after a new identity has been created locally,
/// e.g. creating the matching profile in another service.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self, identity: &Identity, username: &str) -> Result<(), IdentityError>;
}

/// Provisioner for deployments with no downstream dependents.
pub struct NoopProvisioner;

#[async_trait]
impl Provisioner for NoopProvisioner {
    async fn provision(&self, _identity: &Identity, _username: &str) -> Result<(), IdentityError> {
        Ok(())
    }
}
