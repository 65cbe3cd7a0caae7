//! Core abstractions for the livecrud client.
//!
//! This crate provides the fundamental building blocks:
//! - `Record` / `RecordId` - Opaque records keyed by identifier
//! - `ChangeNotification` - Typed realtime change events
//! - `RecordCache` + `apply` - Immutable snapshots and the cache patcher
//! - `CacheStore` - The live snapshot holder with broadcast
//! - `Credential` - Access credentials with advisory expiry
//! - Auth, CRUD and credential-store traits
//! - `ClientConfig` - Configuration and policy values

pub mod cache;
pub mod cache_store;
pub mod config;
pub mod credential;
pub mod notification;
pub mod record;
pub mod traits;

pub use cache::RecordCache;
pub use cache_store::{CacheStore, CacheUpdate, PendingFetch};
pub use config::{ClientConfig, ReconnectPolicy};
pub use credential::{Credential, LoginGrant, PersistedSession, Principal};
pub use notification::ChangeNotification;
pub use record::{Record, RecordId};
pub use traits::{ApiError, AuthApi, CredentialStore, CrudApi, StoreError};
