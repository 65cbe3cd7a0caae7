//! In-memory credential store.

use std::sync::RwLock;

use async_trait::async_trait;
use livecrud_core::{CredentialStore, PersistedSession, StoreError};

/// In-memory storage implementation.
///
/// Useful for tests and for processes that must not leave credentials on
/// disk. Data is lost on restart.
#[derive(Default)]
pub struct MemoryCredentialStore {
    session: RwLock<Option<PersistedSession>>,
}

impl MemoryCredentialStore {
    /// Create an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds `session`, as if left by a
    /// previous run.
    #[must_use]
    pub fn with_session(session: PersistedSession) -> Self {
        Self {
            session: RwLock::new(Some(session)),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Result<Option<PersistedSession>, StoreError> {
        Ok(self
            .session
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .clone())
    }

    async fn save(&self, session: &PersistedSession) -> Result<(), StoreError> {
        *self
            .session
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))? = Some(session.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.session
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use livecrud_core::Credential;

    use super::*;

    #[tokio::test]
    async fn test_save_load_clear() {
        let store = MemoryCredentialStore::new();
        assert!(store.load().await.unwrap().is_none());

        let session = PersistedSession {
            credential: Credential::from_token("t1"),
            principal: None,
        };
        store.save(&session).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(session));

        store.clear().await.unwrap();
        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
    }
}
