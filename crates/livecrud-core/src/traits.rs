//! Collaborator traits: the auth and CRUD endpoint sets and credential
//! persistence.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::{
    credential::{Credential, LoginGrant, PersistedSession},
    record::{Record, RecordId},
};

/// Field errors reported by the backend, passed through verbatim.
pub type FieldErrors = BTreeMap<String, Value>;

/// Error from a remote endpoint.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApiError {
    #[error("Network failure: {0}")]
    Network(String),
    #[error("Not authorized")]
    Unauthorized,
    #[error("Validation failed: {0:?}")]
    Validation(FieldErrors),
    #[error("Request failed with status {status}: {detail}")]
    Status { status: u16, detail: String },
    #[error("Failed to decode response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Whether this is a 401-class rejection of the attached credential.
    #[must_use]
    pub const fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }
}

/// Credential store error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// The auth endpoint set.
///
/// `refresh` relies on a longer-lived credential the transport carries on
/// its own (an HTTP-only cookie), which is why it takes no argument.
#[async_trait]
pub trait AuthApi: Send + Sync {
    /// Exchange username and password for a credential.
    async fn login(&self, username: &str, password: &str) -> Result<LoginGrant, ApiError>;

    /// Invalidate the session server-side. Best-effort.
    async fn logout(&self, token: Option<&str>) -> Result<(), ApiError>;

    /// Check that `token` is still accepted.
    async fn verify(&self, token: &str) -> Result<(), ApiError>;

    /// Obtain a new access credential.
    async fn refresh(&self) -> Result<Credential, ApiError>;
}

/// The CRUD endpoint set over one record resource.
#[async_trait]
pub trait CrudApi: Send + Sync {
    /// List records.
    async fn list(&self, token: Option<&str>) -> Result<Vec<Record>, ApiError>;

    /// Create a record from `body`.
    async fn create(&self, token: &str, body: &Value) -> Result<Record, ApiError>;

    /// Apply a partial update.
    async fn update(&self, token: &str, id: &RecordId, patch: &Value) -> Result<Record, ApiError>;

    /// Delete a record.
    async fn delete(&self, token: &str, id: &RecordId) -> Result<(), ApiError>;
}

/// Persistence for the session across process runs.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load the persisted session, if any.
    async fn load(&self) -> Result<Option<PersistedSession>, StoreError>;

    /// Persist the session, replacing what was there.
    async fn save(&self, session: &PersistedSession) -> Result<(), StoreError>;

    /// Remove the persisted session. Clearing an empty store succeeds.
    async fn clear(&self) -> Result<(), StoreError>;
}
