//! Single-flight credential refresh.
//!
//! Concurrent callers that discover an expired credential share one
//! refresh exchange instead of each starting their own.

use std::sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicU64, Ordering},
};

use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use livecrud_core::{ApiError, Credential};
use thiserror::Error;

/// Outcome shared by every waiter of a failed refresh.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RefreshError {
    #[error("Refresh rejected: {0}")]
    Rejected(ApiError),
    #[error("Session ended before the refresh completed")]
    SessionEnded,
    #[error("Refresh task aborted")]
    Aborted,
}

/// The operation that actually exchanges credentials.
pub type RefreshExchange =
    Box<dyn Fn() -> BoxFuture<'static, Result<Credential, RefreshError>> + Send + Sync>;

type SharedRefresh = Shared<BoxFuture<'static, Result<Credential, RefreshError>>>;

struct InFlight {
    generation: u64,
    future: SharedRefresh,
}

/// Coalesces refresh demands into at most one outstanding exchange.
///
/// The slot is occupied from the moment the first caller arrives until the
/// exchange settles; anyone arriving in between attaches to the same
/// future. The exchange runs on its own task, so it completes even if every
/// waiter goes away.
pub struct RefreshCoordinator {
    exchange: RefreshExchange,
    slot: Arc<Mutex<Option<InFlight>>>,
    started: AtomicU64,
}

fn lock(slot: &Mutex<Option<InFlight>>) -> MutexGuard<'_, Option<InFlight>> {
    match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl RefreshCoordinator {
    /// Create a coordinator around `exchange`.
    #[must_use]
    pub fn new<F>(exchange: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<Credential, RefreshError>> + Send + Sync + 'static,
    {
        Self {
            exchange: Box::new(exchange),
            slot: Arc::new(Mutex::new(None)),
            started: AtomicU64::new(0),
        }
    }

    /// Join the outstanding refresh, or start one if none is outstanding.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    /// Returns the shared failure of the exchange this caller attached to.
    pub async fn acquire(&self) -> Result<Credential, RefreshError> {
        let future = {
            let mut slot = lock(&self.slot);
            if let Some(in_flight) = slot.as_ref() {
                tracing::debug!(generation = in_flight.generation, "Joining in-flight refresh");
                in_flight.future.clone()
            } else {
                let generation = self.started.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::debug!(generation, "Starting refresh exchange");

                let exchange = (self.exchange)();
                let slot_ref = Arc::clone(&self.slot);
                let task = tokio::spawn(async move {
                    let result = exchange.await;
                    // Clear before any waiter sees the result, so the next
                    // expiry starts a fresh exchange.
                    let mut slot = lock(&slot_ref);
                    if slot.as_ref().is_some_and(|s| s.generation == generation) {
                        *slot = None;
                    }
                    result
                });

                let future = async move { task.await.unwrap_or(Err(RefreshError::Aborted)) }
                    .boxed()
                    .shared();
                *slot = Some(InFlight {
                    generation,
                    future: future.clone(),
                });
                future
            }
        };
        future.await
    }

    /// Forget the outstanding exchange without cancelling it.
    ///
    /// Its current waiters still get its outcome; the next `acquire`
    /// starts a new exchange.
    pub fn detach(&self) {
        if let Some(in_flight) = lock(&self.slot).take() {
            tracing::debug!(generation = in_flight.generation, "Detaching in-flight refresh");
        }
    }

    /// Whether an exchange is outstanding.
    #[must_use]
    pub fn in_flight(&self) -> bool {
        lock(&self.slot).is_some()
    }

    /// Number of exchanges started so far.
    #[must_use]
    pub fn exchanges_started(&self) -> u64 {
        self.started.load(Ordering::SeqCst)
    }
}
