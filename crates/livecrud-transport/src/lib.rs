//! Transport layer for the livecrud client.
//!
//! Provides:
//! - Wire protocol for realtime change notifications
//! - Connection manager with a reconnect state machine
//! - WebSocket transport (feature: websocket)
//! - HTTP auth and CRUD backend (feature: http)

pub mod connection;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "http")]
pub mod http;

pub use connection::{
    ConnectionEvent, ConnectionMachine, ConnectionManager, ConnectionState, Connector, Incoming,
    Transport, TransportError,
};
pub use protocol::ProtocolError;

#[cfg(feature = "websocket")]
pub use websocket::WsConnector;

#[cfg(feature = "http")]
pub use http::HttpBackend;
