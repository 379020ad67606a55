//! # lib_parking
//!
//! Client-side runtime for live parking-lot updates. The `core` module owns
//! the single WebSocket connection, the per-lot cache and the listener
//! dispatcher; `retrieve` holds the HTTP client for the lot and booking
//! endpoints.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Connection manager, topic registry and dispatcher.
#[cfg(feature = "realtime")]
pub mod core;

/// HTTP client for the lot and booking endpoints.
#[cfg(feature = "retrieve")]
pub mod retrieve;

#[cfg(feature = "realtime")]
pub use crate::core::{
    Channel, ClientMessage, ConnectionState, ConnectionStatus, EventKind, ListenerId, LotId,
    LotSnapshot, Price, RealtimeClient, RealtimeConfig, RealtimeError, RealtimeEvent,
};
