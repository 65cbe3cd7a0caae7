//! Authorized CRUD that keeps the local cache in step with this client's
//! own writes.

use std::sync::Arc;

use livecrud_core::{CacheStore, CrudApi, Record, RecordCache, RecordId};
use serde_json::Value;

use crate::manager::{SessionError, SessionManager};

/// Record operations on behalf of the current session.
///
/// Realtime notifications for the same writes may arrive later; the cache
/// patcher treats those as no-ops or in-place replacements.
pub struct RecordService {
    api: Arc<dyn CrudApi>,
    session: Arc<SessionManager>,
    cache: Arc<CacheStore>,
}

impl RecordService {
    #[must_use]
    pub fn new(api: Arc<dyn CrudApi>, session: Arc<SessionManager>, cache: Arc<CacheStore>) -> Self {
        Self {
            api,
            session,
            cache,
        }
    }

    /// The cache this service writes into.
    #[must_use]
    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    /// Fetch the full collection and replace the cache with it.
    ///
    /// Changes that reach the cache while the list is in flight are
    /// reapplied on top of it.
    ///
    /// Listing is allowed anonymously; with a session the request is
    /// authorized.
    ///
    /// # Errors
    /// Returns the mapped API error; the cache is left untouched.
    pub async fn load(&self) -> Result<RecordCache, SessionError> {
        let fetch = self.cache.begin_fetch();
        let records = if self.session.is_authenticated() {
            self.session
                .authorized(|token| {
                    let api = Arc::clone(&self.api);
                    async move { api.list(Some(&token)).await }
                })
                .await?
        } else {
            self.api.list(None).await?
        };
        tracing::debug!(count = records.len(), "Loaded records");
        Ok(fetch.complete(records))
    }

    /// Create a record.
    ///
    /// # Errors
    /// `Validation` carries the server's field errors unchanged.
    pub async fn create(&self, body: &Value) -> Result<Record, SessionError> {
        let record = self
            .session
            .authorized(|token| {
                let api = Arc::clone(&self.api);
                async move { api.create(&token, body).await }
            })
            .await?;
        tracing::debug!(id = %record.id, "Created record");
        self.cache.record_created(record.clone());
        Ok(record)
    }

    /// Apply a partial update to a record.
    ///
    /// # Errors
    /// `Validation` carries the server's field errors unchanged.
    pub async fn update(&self, id: &RecordId, patch: &Value) -> Result<Record, SessionError> {
        let record = self
            .session
            .authorized(|token| {
                let api = Arc::clone(&self.api);
                async move { api.update(&token, id, patch).await }
            })
            .await?;
        tracing::debug!(%id, "Updated record");
        self.cache.record_updated(record.clone());
        Ok(record)
    }

    /// Delete a record.
    ///
    /// # Errors
    /// Returns the mapped API error; the cache is left untouched.
    pub async fn delete(&self, id: &RecordId) -> Result<(), SessionError> {
        self.session
            .authorized(|token| {
                let api = Arc::clone(&self.api);
                async move { api.delete(&token, id).await }
            })
            .await?;
        tracing::debug!(%id, "Deleted record");
        self.cache.record_deleted(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use livecrud_core::{ApiError, AuthApi, ChangeNotification, Credential, LoginGrant, Principal};
    use serde_json::json;

    use super::*;
    use crate::{bus::LogoutBus, manager::SessionOptions, storage::MemoryCredentialStore};

    /// Hands out T1 on login and T2 on refresh.
    #[derive(Default)]
    struct FakeAuth {
        refreshes: AtomicUsize,
    }

    #[async_trait]
    impl AuthApi for FakeAuth {
        async fn login(&self, _username: &str, _password: &str) -> Result<LoginGrant, ApiError> {
            Ok(LoginGrant {
                credential: Credential::from_token("T1"),
                principal: Principal {
                    id: json!(1),
                    username: "admin".to_string(),
                    email: None,
                },
            })
        }

        async fn logout(&self, _token: Option<&str>) -> Result<(), ApiError> {
            Ok(())
        }

        async fn verify(&self, _token: &str) -> Result<(), ApiError> {
            Ok(())
        }

        async fn refresh(&self) -> Result<Credential, ApiError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(Credential::from_token("T2"))
        }
    }

    /// Accepts only `accepted`; records every token it was shown.
    struct FakeCrud {
        accepted: &'static str,
        seen: Mutex<Vec<Option<String>>>,
        next_id: AtomicUsize,
        list_delay: Duration,
    }

    impl FakeCrud {
        fn new(accepted: &'static str) -> Self {
            Self {
                accepted,
                seen: Mutex::new(Vec::new()),
                next_id: AtomicUsize::new(1),
                list_delay: Duration::ZERO,
            }
        }

        fn check(&self, token: Option<&str>) -> Result<(), ApiError> {
            self.seen.lock().unwrap().push(token.map(str::to_string));
            match token {
                Some(t) if t != self.accepted => Err(ApiError::Unauthorized),
                _ => Ok(()),
            }
        }
    }

    #[async_trait]
    impl CrudApi for FakeCrud {
        async fn list(&self, token: Option<&str>) -> Result<Vec<Record>, ApiError> {
            self.check(token)?;
            tokio::time::sleep(self.list_delay).await;
            Ok(vec![
                Record::new(1_i64).with_field("name", json!("circle")),
                Record::new(2_i64).with_field("name", json!("square")),
            ])
        }

        async fn create(&self, token: &str, body: &Value) -> Result<Record, ApiError> {
            self.check(Some(token))?;
            if body.get("name").is_none() {
                let mut fields = BTreeMap::new();
                fields.insert("name".to_string(), json!(["This field is required."]));
                return Err(ApiError::Validation(fields));
            }
            let id = i64::try_from(self.next_id.fetch_add(1, Ordering::SeqCst)).unwrap() + 100;
            let mut record = Record::new(id);
            if let Value::Object(map) = body {
                record.fields.extend(map.clone());
            }
            Ok(record)
        }

        async fn update(&self, token: &str, id: &RecordId, patch: &Value) -> Result<Record, ApiError> {
            self.check(Some(token))?;
            let mut record = Record::new(id.clone());
            if let Value::Object(map) = patch {
                record.fields.extend(map.clone());
            }
            Ok(record)
        }

        async fn delete(&self, token: &str, _id: &RecordId) -> Result<(), ApiError> {
            self.check(Some(token))
        }
    }

    struct Fixture {
        auth: Arc<FakeAuth>,
        crud: Arc<FakeCrud>,
        session: Arc<SessionManager>,
        service: RecordService,
    }

    fn fixture(accepted: &'static str) -> Fixture {
        fixture_with(FakeCrud::new(accepted))
    }

    fn fixture_with(crud: FakeCrud) -> Fixture {
        let auth = Arc::new(FakeAuth::default());
        let crud = Arc::new(crud);
        let session = SessionManager::new(
            auth.clone(),
            Arc::new(MemoryCredentialStore::new()),
            LogoutBus::new(),
            SessionOptions::default(),
        );
        let service = RecordService::new(
            crud.clone(),
            Arc::clone(&session),
            Arc::new(CacheStore::new()),
        );
        Fixture {
            auth,
            crud,
            session,
            service,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_anonymous_load_fills_cache() {
        let f = fixture("T1");
        let snapshot = f.service.load().await.unwrap();

        assert_eq!(snapshot.len(), 2);
        assert_eq!(f.service.cache().snapshot(), snapshot);
        assert_eq!(*f.crud.seen.lock().unwrap(), vec![None]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_changes_during_load_survive_the_list() {
        let f = fixture_with(FakeCrud {
            list_delay: Duration::from_millis(100),
            ..FakeCrud::new("T1")
        });
        let cache = Arc::clone(f.service.cache());

        let realtime = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cache.apply(&ChangeNotification::Deleted(RecordId::from(1_i64)));
            cache.apply(&ChangeNotification::Created(
                Record::new(3_i64).with_field("name", json!("star")),
            ));
        };
        let (loaded, ()) = tokio::join!(f.service.load(), realtime);

        let expected = vec![RecordId::from(3_i64), RecordId::from(2_i64)];
        assert_eq!(loaded.unwrap().ids(), expected);
        assert_eq!(cache.snapshot().ids(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_retries_after_refresh() {
        let f = fixture("T2");
        f.session.login("admin", "secret").await.unwrap();

        let record = f.service.create(&json!({"name": "triangle"})).await.unwrap();

        assert_eq!(f.auth.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(
            *f.crud.seen.lock().unwrap(),
            vec![Some("T1".to_string()), Some("T2".to_string())]
        );
        assert_eq!(f.session.current_token().as_deref(), Some("T2"));
        let cached = f.service.cache().snapshot();
        assert_eq!(cached.get(&record.id), Some(&record));
        assert_eq!(cached.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_errors_pass_through() {
        let f = fixture("T1");
        f.session.login("admin", "secret").await.unwrap();

        let err = f.service.create(&json!({"colour": "red"})).await.unwrap_err();

        let SessionError::Validation(fields) = err else {
            panic!("expected validation error, got {err:?}");
        };
        assert!(fields.contains_key("name"));
        assert!(f.service.cache().snapshot().is_empty());
        assert_eq!(f.auth.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_and_delete_patch_cache() {
        let f = fixture("T1");
        f.session.login("admin", "secret").await.unwrap();
        f.service.load().await.unwrap();

        let id = RecordId::from(1_i64);
        f.service
            .update(&id, &json!({"name": "oval"}))
            .await
            .unwrap();
        let cached = f.service.cache().snapshot();
        assert_eq!(cached.get(&id).unwrap().field("name"), Some(&json!("oval")));
        assert_eq!(cached.ids(), vec![RecordId::from(1_i64), RecordId::from(2_i64)]);

        f.service.delete(&id).await.unwrap();
        let cached = f.service.cache().snapshot();
        assert!(!cached.contains(&id));
        assert_eq!(cached.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_require_session() {
        let f = fixture("T1");
        let err = f.service.delete(&RecordId::from(1_i64)).await.unwrap_err();
        assert_eq!(err, SessionError::NotAuthenticated);
        assert!(f.crud.seen.lock().unwrap().is_empty());
    }
}
