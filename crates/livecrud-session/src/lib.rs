//! Session orchestration for the livecrud client.
//!
//! Provides:
//! - `SessionManager` - Authentication state machine with refresh-and-retry
//! - `RefreshCoordinator` - Single-flight credential refresh
//! - `LogoutBus` - Cross-session logout broadcast
//! - `RecordService` - Authorized CRUD that patches the local cache
//! - Credential stores (memory, file)

pub mod bus;
pub mod manager;
pub mod records;
pub mod refresh;
pub mod storage;

pub use bus::{LogoutBus, LogoutEvent, MemberId};
pub use manager::{SessionError, SessionManager, SessionOptions, SessionState};
pub use records::RecordService;
pub use refresh::{RefreshCoordinator, RefreshError};
