//! # Data Retrieval Module
//!
//! HTTP access to the parking backend's REST endpoints. The realtime module
//! only streams changes; the lot as a whole and bookings are fetched and
//! created here.
//!
//! ## Contained Modules:
//!
//! - **`parking_api`**: `ParkingApi`, a `reqwest` client with
//!   `reqwest-middleware` retry support, and the lot and booking types it
//!   reads and writes.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Lot and booking endpoints with automatic retries.
pub mod parking_api;

pub use parking_api::{ApiResponse, Booking, BookingRequest, ParkingApi, ParkingLot};
