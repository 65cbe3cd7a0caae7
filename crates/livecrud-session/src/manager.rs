//! Session manager: owns the authentication state machine.
//!
//! ```text
//! Anonymous ──start()──▶ Verifying ──ok──▶ Authenticated ◀──┐
//!     ▲                     │ fail              │ timer/401 │ ok
//!     │                     └──▶ refresh        ▼           │
//!     └───────── fail / logout / remote ── Refreshing ──────┘
//! ```

use std::{
    future::Future,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use futures::FutureExt;
use livecrud_core::{
    ApiError, AuthApi, Credential, CredentialStore, PersistedSession, Principal,
    config::DEFAULT_REFRESH_INTERVAL, credential::unix_now, traits::FieldErrors,
};
use tokio::{
    sync::{broadcast::error::RecvError, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

use crate::{
    bus::{LogoutBus, MemberId},
    refresh::{RefreshCoordinator, RefreshError},
};

/// Credentials this close to expiry are refreshed before use.
const EXPIRY_SKEW: Duration = Duration::from_secs(5);

/// Authentication state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No credential.
    Anonymous,
    /// Checking a persisted credential at startup.
    Verifying,
    /// Holding a credential believed valid.
    Authenticated,
    /// Exchanging the credential for a new one.
    Refreshing,
}

/// Session manager error.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum SessionError {
    #[error("Not authenticated")]
    NotAuthenticated,
    #[error("Authentication failed")]
    AuthFailure,
    #[error("Credential refresh failed: {0}")]
    RefreshExhausted(RefreshError),
    #[error("Network failure: {0}")]
    Network(String),
    #[error("Validation failed: {0:?}")]
    Validation(FieldErrors),
    #[error("API error: {0}")]
    Api(ApiError),
}

impl From<ApiError> for SessionError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Unauthorized => Self::AuthFailure,
            ApiError::Network(msg) => Self::Network(msg),
            ApiError::Validation(fields) => Self::Validation(fields),
            other => Self::Api(other),
        }
    }
}

impl From<RefreshError> for SessionError {
    fn from(err: RefreshError) -> Self {
        match err {
            RefreshError::SessionEnded => Self::NotAuthenticated,
            other => Self::RefreshExhausted(other),
        }
    }
}

/// Session manager options.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Proactive refresh cadence. Must be shorter than the shortest
    /// credential lifetime the server issues.
    pub refresh_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: SessionState,
    credential: Option<Credential>,
    principal: Option<Principal>,
    /// Bumped whenever a session begins or ends. Late results tagged with
    /// an older epoch are discarded.
    epoch: u64,
}

/// Process-wide session state with a defined lifecycle.
///
/// Construct one per "tab" and share it as `Arc<SessionManager>`. Managers
/// that share a [`LogoutBus`] log out together.
pub struct SessionManager {
    id: MemberId,
    weak: Weak<Self>,
    auth: Arc<dyn AuthApi>,
    store: Arc<dyn CredentialStore>,
    bus: LogoutBus,
    options: SessionOptions,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<SessionState>,
    refresh: RefreshCoordinator,
    timer: Mutex<Option<JoinHandle<()>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl SessionManager {
    /// Create a new session manager in the `Anonymous` state.
    ///
    /// Must be called within a Tokio runtime: it starts listening on the
    /// logout bus immediately.
    #[must_use]
    pub fn new(
        auth: Arc<dyn AuthApi>,
        store: Arc<dyn CredentialStore>,
        bus: LogoutBus,
        options: SessionOptions,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SessionState::Anonymous);
        let manager = Arc::new_cyclic(|weak: &Weak<Self>| {
            let exchange_owner = weak.clone();
            Self {
                id: MemberId::new_v4(),
                weak: weak.clone(),
                auth,
                store,
                bus,
                options,
                inner: Mutex::new(Inner {
                    state: SessionState::Anonymous,
                    credential: None,
                    principal: None,
                    epoch: 0,
                }),
                state_tx,
                refresh: RefreshCoordinator::new(move || {
                    let owner = exchange_owner.clone();
                    async move {
                        match owner.upgrade() {
                            Some(manager) => manager.run_refresh_exchange().await,
                            None => Err(RefreshError::SessionEnded),
                        }
                    }
                    .boxed()
                }),
                timer: Mutex::new(None),
                listener: Mutex::new(None),
            }
        });
        manager.listen_for_remote_logout();
        manager
    }

    /// This manager's identity on the logout bus.
    #[must_use]
    pub const fn member_id(&self) -> MemberId {
        self.id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        lock(&self.inner).state
    }

    /// Watch state transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Authenticated | SessionState::Refreshing
        )
    }

    /// The credential to attach to the next request, if any.
    #[must_use]
    pub fn current_token(&self) -> Option<String> {
        lock(&self.inner).credential.as_ref().map(|c| c.token.clone())
    }

    /// The logged-in principal, if known.
    #[must_use]
    pub fn principal(&self) -> Option<Principal> {
        lock(&self.inner).principal.clone()
    }

    /// Number of refresh exchanges started by this manager.
    #[must_use]
    pub fn refresh_exchanges(&self) -> u64 {
        self.refresh.exchanges_started()
    }

    fn epoch(&self) -> u64 {
        lock(&self.inner).epoch
    }

    fn set_state(&self, inner: &mut Inner, state: SessionState) {
        if inner.state != state {
            tracing::debug!(from = ?inner.state, to = ?state, epoch = inner.epoch, "Session transition");
            inner.state = state;
            self.state_tx.send_replace(state);
        }
    }

    /// Cold start: adopt a persisted credential if the server still
    /// accepts it (directly or after a refresh).
    pub async fn start(&self) -> SessionState {
        let persisted = match self.store.load().await {
            Ok(persisted) => persisted,
            Err(e) => {
                tracing::warn!("Failed to load persisted session: {e}");
                None
            }
        };
        let Some(persisted) = persisted else {
            return self.state();
        };

        let epoch = {
            let mut inner = lock(&self.inner);
            if inner.state != SessionState::Anonymous {
                // Someone logged in while we were reading the store.
                return inner.state;
            }
            inner.epoch += 1;
            inner.credential = Some(persisted.credential.clone());
            inner.principal = persisted.principal;
            self.set_state(&mut inner, SessionState::Verifying);
            inner.epoch
        };

        match self.auth.verify(&persisted.credential.token).await {
            Ok(()) => {
                let verified = {
                    let mut inner = lock(&self.inner);
                    let current = inner.epoch == epoch && inner.state == SessionState::Verifying;
                    if current {
                        self.set_state(&mut inner, SessionState::Authenticated);
                    }
                    current
                };
                if verified {
                    tracing::info!("Persisted session verified");
                    self.start_timer(epoch);
                }
            }
            Err(e) => {
                tracing::debug!("Persisted credential rejected ({e}), trying refresh");
                if let Err(e) = self.refresh.acquire().await {
                    tracing::info!("Could not restore session: {e}");
                }
            }
        }
        self.state()
    }

    /// Log in with username and password.
    ///
    /// # Errors
    /// `AuthFailure` if the server rejects the credentials; network and
    /// validation failures are passed through.
    pub async fn login(&self, username: &str, password: &str) -> Result<Principal, SessionError> {
        let grant = self.auth.login(username, password).await?;

        let epoch = {
            let mut inner = lock(&self.inner);
            inner.epoch += 1;
            inner.credential = Some(grant.credential.clone());
            inner.principal = Some(grant.principal.clone());
            self.set_state(&mut inner, SessionState::Authenticated);
            inner.epoch
        };
        // A refresh from the previous session must not be joined by this one.
        self.refresh.detach();
        tracing::info!(username, "Logged in");

        self.persist(epoch).await;
        self.start_timer(epoch);
        Ok(grant.principal)
    }

    /// Log out: best-effort server-side invalidation, then always clear
    /// local state and tell every other session.
    pub async fn logout(&self) {
        let token = self.current_token();
        if let Err(e) = self.auth.logout(token.as_deref()).await {
            tracing::warn!("Server-side logout failed, clearing local session anyway: {e}");
        }
        self.end_session(None, true).await;
        tracing::info!("Logged out");
    }

    /// Refresh the credential now, joining any refresh already underway.
    ///
    /// # Errors
    /// `NotAuthenticated` without a session; `RefreshExhausted` if the
    /// exchange failed (the session is over in that case).
    pub async fn refresh_now(&self) -> Result<Credential, SessionError> {
        if !self.is_authenticated() {
            return Err(SessionError::NotAuthenticated);
        }
        Ok(self.refresh.acquire().await?)
    }

    /// Run an authenticated request.
    ///
    /// `op` receives the token to attach. If it fails with an
    /// authorization error the credential is refreshed and `op` runs once
    /// more; a second authorization failure is final. A credential already
    /// known to be expired is refreshed up front, and that counts as the
    /// request's one refresh.
    ///
    /// # Errors
    /// `NotAuthenticated` without a session, `RefreshExhausted` when the
    /// refresh fails, `AuthFailure` on a second rejection, otherwise the
    /// mapped error from `op`.
    pub async fn authorized<T, F, Fut>(&self, mut op: F) -> Result<T, SessionError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let credential = lock(&self.inner)
            .credential
            .clone()
            .ok_or(SessionError::NotAuthenticated)?;

        let refreshed_first = credential.expires_within(unix_now(), EXPIRY_SKEW);
        let token = if refreshed_first {
            tracing::debug!("Credential expired or about to, refreshing before request");
            self.refresh.acquire().await?.token
        } else {
            credential.token
        };

        match op(token.clone()).await {
            Err(e) if e.is_auth_failure() => {}
            other => return other.map_err(SessionError::from),
        }
        if refreshed_first {
            // The one refresh this request gets has already happened.
            tracing::warn!("Request rejected with a freshly refreshed credential");
            return Err(SessionError::AuthFailure);
        }

        // A refresh may have landed while this request was in flight.
        let retry_token = match self.current_token() {
            Some(current) if current != token => current,
            _ => {
                tracing::debug!("Request rejected with authorization error, refreshing");
                self.refresh.acquire().await?.token
            }
        };

        match op(retry_token).await {
            Err(e) if e.is_auth_failure() => {
                tracing::warn!("Request rejected again after refresh");
                Err(SessionError::AuthFailure)
            }
            other => other.map_err(SessionError::from),
        }
    }

    /// The body of every refresh exchange. Runs at most once at a time and
    /// owns all refresh side effects, so they happen once per exchange no
    /// matter how many callers wait on it.
    async fn run_refresh_exchange(self: Arc<Self>) -> Result<Credential, RefreshError> {
        let (epoch, previous) = {
            let mut inner = lock(&self.inner);
            let previous = inner.state;
            if previous == SessionState::Authenticated {
                self.set_state(&mut inner, SessionState::Refreshing);
            }
            (inner.epoch, previous)
        };
        if previous == SessionState::Anonymous {
            return Err(RefreshError::SessionEnded);
        }

        match self.auth.refresh().await {
            Ok(credential) => {
                let applied = {
                    let mut inner = lock(&self.inner);
                    let current = inner.epoch == epoch && inner.state != SessionState::Anonymous;
                    if current {
                        inner.credential = Some(credential.clone());
                        self.set_state(&mut inner, SessionState::Authenticated);
                    }
                    current
                };
                if !applied {
                    tracing::debug!(epoch, "Discarding refresh result for an ended session");
                    return Err(RefreshError::SessionEnded);
                }
                tracing::debug!(epoch, "Credential refreshed");
                self.persist(epoch).await;
                if previous == SessionState::Verifying {
                    self.start_timer(epoch);
                }
                Ok(credential)
            }
            Err(e) => {
                tracing::warn!(epoch, "Credential refresh failed: {e}");
                // A session that never got past verification has nobody to
                // tell; an established one logs out everywhere.
                let broadcast = previous != SessionState::Verifying;
                self.end_session(Some(epoch), broadcast).await;
                Err(RefreshError::Rejected(e))
            }
        }
    }

    /// Write the in-memory session to the store, unless it ended meanwhile.
    async fn persist(&self, epoch: u64) {
        let snapshot = {
            let inner = lock(&self.inner);
            if inner.epoch != epoch {
                return;
            }
            inner.credential.clone().map(|credential| PersistedSession {
                credential,
                principal: inner.principal.clone(),
            })
        };
        let Some(snapshot) = snapshot else { return };

        if let Err(e) = self.store.save(&snapshot).await {
            tracing::warn!("Failed to persist session: {e}");
        }
        // A logout may have cleared the store while we were writing.
        if self.epoch() != epoch {
            if let Err(e) = self.store.clear().await {
                tracing::warn!("Failed to clear persisted session: {e}");
            }
        }
    }

    /// Transition to `Anonymous`, clearing memory and the store.
    ///
    /// With `only_epoch`, does nothing if that session already ended.
    /// Returns whether a transition happened.
    async fn end_session(&self, only_epoch: Option<u64>, broadcast: bool) -> bool {
        {
            let mut inner = lock(&self.inner);
            if only_epoch.is_some_and(|e| e != inner.epoch) {
                return false;
            }
            if inner.state == SessionState::Anonymous && inner.credential.is_none() {
                return false;
            }
            inner.epoch += 1;
            inner.credential = None;
            inner.principal = None;
            self.set_state(&mut inner, SessionState::Anonymous);
        }
        self.refresh.detach();
        self.stop_timer();

        if let Err(e) = self.store.clear().await {
            tracing::warn!("Failed to clear persisted session: {e}");
        }
        if broadcast {
            self.bus.publish(self.id);
        }
        true
    }

    async fn on_remote_logout(&self) {
        if self.end_session(None, false).await {
            tracing::info!("Logged out by another session");
        }
    }

    fn listen_for_remote_logout(&self) {
        let mut rx = self.bus.subscribe();
        let me = self.id;
        let weak = self.weak.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.from == me => {}
                    // Every message on the bus is a logout, so a missed one
                    // still means log out.
                    Ok(_) | Err(RecvError::Lagged(_)) => {
                        let Some(manager) = weak.upgrade() else { break };
                        manager.on_remote_logout().await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        *lock(&self.listener) = Some(handle);
    }

    fn start_timer(&self, epoch: u64) {
        let interval = self.options.refresh_interval;
        let weak = self.weak.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                if manager.epoch() != epoch {
                    break;
                }
                tracing::debug!(epoch, "Proactive credential refresh");
                if let Err(e) = manager.refresh.acquire().await {
                    tracing::debug!(epoch, "Proactive refresh ended the session: {e}");
                    break;
                }
            }
        });

        if let Some(previous) = lock(&self.timer).replace(handle) {
            previous.abort();
        }
    }

    fn stop_timer(&self) {
        if let Some(handle) = lock(&self.timer).take() {
            handle.abort();
        }
    }

    #[cfg(test)]
    fn timer_running(&self) -> bool {
        lock(&self.timer).as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.stop_timer();
        if let Some(handle) = lock(&self.listener).take() {
            handle.abort();
        }
    }
}
