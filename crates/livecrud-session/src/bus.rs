//! Logout broadcast shared by every session in the process.

use tokio::sync::broadcast;
use uuid::Uuid;

/// Identifier of one session manager on the bus.
pub type MemberId = Uuid;

/// The one message the bus carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogoutEvent {
    /// Member that published the event.
    pub from: MemberId,
}

/// Broadcast primitive that turns one session's logout into every
/// session's logout.
///
/// Cloning yields another handle to the same bus.
#[derive(Clone)]
pub struct LogoutBus {
    sender: broadcast::Sender<LogoutEvent>,
}

impl Default for LogoutBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LogoutBus {
    /// Create a new bus.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(16);
        Self { sender }
    }

    /// Announce a logout. Returns the number of members that will see it.
    pub fn publish(&self, from: MemberId) -> usize {
        let receivers = self.sender.send(LogoutEvent { from }).unwrap_or(0);
        tracing::debug!(%from, receivers, "Published logout");
        receivers
    }

    /// Receive logout events published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LogoutEvent> {
        self.sender.subscribe()
    }
}
