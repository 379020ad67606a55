//! # Core Realtime Module
//!
//! This module is the realtime client runtime. It keeps exactly one
//! persistent WebSocket open to the parking backend, multiplexes lot
//! subscriptions over it and fans decoded updates out to local listeners.
//!
//! ## Core Components:
//!
//! - **`envelope`**: The wire format. Outgoing control messages and incoming
//!   server messages as tagged enums, with shape checks at decode time.
//!
//! - **`events`**: The local events handed to listeners (`connection_status`,
//!   `parking_update`, `price_update`, `booking_update`, `notification`).
//!
//! - **`registry`**: The per-lot cache and the subscription intent. Applies
//!   each decoded message to the cache and decides which event, if any, it
//!   produces.
//!
//! - **`dispatcher`**: Listener registration keyed by event kind. Invokes
//!   listeners in registration order and isolates panicking ones.
//!
//! - **`transport`**: Endpoint derivation and the `Connector` seam, with the
//!   `tokio-tungstenite` implementation used in production.
//!
//! - **`connection`**: The connection manager task. Lifecycle state machine,
//!   heartbeat, linear reconnect backoff and subscription replay.
//!
//! - **`client`**: `RealtimeClient`, the owned handle callers use to drive
//!   the manager task.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Wire messages exchanged with the server.
pub mod envelope;
/// Local events delivered to listeners.
pub mod events;
/// Per-lot cache and subscription intent.
pub mod registry;
/// Ordered, failure-isolated listener fan-out.
pub mod dispatcher;
/// Endpoint derivation and transport implementations.
pub mod transport;
/// The connection manager task and its lifecycle state machine.
pub mod connection;
/// The public client handle.
pub mod client;

mod error;

// --- Public API Re-exports ---
pub use client::{RealtimeClient, RealtimeConfig};
pub use connection::ConnectionState;
pub use dispatcher::{Dispatcher, Listener, ListenerId};
pub use envelope::{ClientMessage, DecodeError, LotId, Price, ServerMessage};
pub use error::RealtimeError;
pub use events::{ConnectionStatus, EventKind, LotSnapshot, RealtimeEvent};
pub use transport::{endpoint_for, Channel, Connector, Frame, TransportSession, TungsteniteConnector};
