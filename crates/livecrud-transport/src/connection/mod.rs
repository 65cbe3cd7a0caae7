//! Realtime connection management.
//!
//! - `machine` - Pure reconnect state machine
//! - `manager` - Tokio driver that owns the transport, timers and reader

pub mod machine;
pub mod manager;

use async_trait::async_trait;
use thiserror::Error;

pub use machine::{ConnId, ConnectionEvent, ConnectionMachine, ConnectionState, Effect, TimerId};
pub use manager::ConnectionManager;

/// Transport-level failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Transport error: {0}")]
    Io(String),
}

/// What a live transport yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// A text payload.
    Text(String),
    /// A binary payload, expected to hold UTF-8 JSON.
    Binary(Vec<u8>),
    /// The peer closed the transport. `was_clean` is true when it did so
    /// with a closing handshake.
    Closed { was_clean: bool },
}

/// One open realtime transport. Receive-only.
#[async_trait]
pub trait Transport: Send {
    /// Wait for the next payload or the end of the transport.
    async fn recv(&mut self) -> Result<Incoming, TransportError>;

    /// Close the transport at this client's request.
    async fn close(&mut self);
}

/// Opens transports to the realtime endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError>;
}
