//! # Local Events
//!
//! What listeners receive. Each [`RealtimeEvent`] variant has a fixed payload
//! shape and maps to exactly one [`EventKind`], which is the key listeners
//! register under.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::core::envelope::{parse_price, LotId, Price};

/// Names of the events the runtime emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Connection lifecycle transitions.
    ConnectionStatus,
    /// A lot's cached attributes changed.
    ParkingUpdate,
    /// A cached lot's price changed.
    PriceUpdate,
    /// A booking changed state.
    BookingUpdate,
    /// A user-facing notification arrived.
    Notification,
}

impl EventKind {
    /// Every event kind, in a stable order.
    pub const ALL: [EventKind; 5] = [
        EventKind::ConnectionStatus,
        EventKind::ParkingUpdate,
        EventKind::PriceUpdate,
        EventKind::BookingUpdate,
        EventKind::Notification,
    ];

    /// The event name as exposed to the rendering layer.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ConnectionStatus => "connection_status",
            EventKind::ParkingUpdate => "parking_update",
            EventKind::PriceUpdate => "price_update",
            EventKind::BookingUpdate => "booking_update",
            EventKind::Notification => "notification",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown event '{}'", s))
    }
}

/// Connection status reported through `connection_status` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// The transport opened.
    Connected,
    /// The transport closed, for any reason.
    Disconnected,
    /// Reconnect attempts are exhausted; only an explicit `start()` retries.
    Failed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Failed => "failed",
        })
    }
}

/// Last-known attributes of a lot: occupancy, price, spot list and whatever
/// else the server sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct LotSnapshot(Map<String, Value>);

impl LotSnapshot {
    /// Wraps a set of attributes.
    pub fn new(attributes: Map<String, Value>) -> Self {
        Self(attributes)
    }

    /// Lot attributes combined with a full spot list, as delivered by `initial_data`.
    pub fn with_spots(mut attributes: Map<String, Value>, spots: Vec<Map<String, Value>>) -> Self {
        attributes.insert(
            "spots".to_string(),
            Value::Array(spots.into_iter().map(Value::Object).collect()),
        );
        Self(attributes)
    }

    /// Looks up a single attribute.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Numeric reading of the cached price, when one has been set.
    pub fn price(&self) -> Option<f64> {
        self.0.get("price").and_then(parse_price)
    }

    /// The cached spot list, empty when none has been received.
    pub fn spots(&self) -> &[Value] {
        self.0
            .get("spots")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// All attributes.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub(crate) fn set_price(&mut self, price: Price) {
        self.0.insert("price".to_string(), price.into_value());
    }

    /// Merges each patch into the spot with the same `id`. Patches without an
    /// `id`, or for spots not in the list, are skipped. Returns how many spots
    /// changed.
    pub(crate) fn merge_spots(&mut self, patches: &[Map<String, Value>]) -> usize {
        let Some(Value::Array(spots)) = self.0.get_mut("spots") else {
            return 0;
        };

        let mut merged = 0;
        for patch in patches {
            let Some(spot_id) = patch.get("id") else {
                continue;
            };
            let target = spots
                .iter_mut()
                .filter_map(Value::as_object_mut)
                .find(|spot| spot.get("id") == Some(spot_id));
            if let Some(spot) = target {
                for (key, value) in patch {
                    spot.insert(key.clone(), value.clone());
                }
                merged += 1;
            }
        }
        merged
    }
}

/// An event delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    /// `connection_status`
    ConnectionStatus(ConnectionStatus),
    /// `parking_update` with the lot's new cached snapshot.
    ParkingUpdate {
        /// The lot that changed.
        id: LotId,
        /// Its cached attributes after the update.
        data: LotSnapshot,
    },
    /// `price_update` for a lot already in the cache.
    PriceUpdate {
        /// The lot that changed.
        id: LotId,
        /// Its new price, as the server sent it: a number stays the same
        /// number and a numeric string stays a string.
        price: Price,
    },
    /// `booking_update` carrying the server's full `booking_status` payload.
    BookingUpdate(Value),
    /// `notification` carrying the server's full payload.
    Notification(Value),
}

impl RealtimeEvent {
    /// The kind listeners register under to receive this event.
    pub fn kind(&self) -> EventKind {
        match self {
            RealtimeEvent::ConnectionStatus(_) => EventKind::ConnectionStatus,
            RealtimeEvent::ParkingUpdate { .. } => EventKind::ParkingUpdate,
            RealtimeEvent::PriceUpdate { .. } => EventKind::PriceUpdate,
            RealtimeEvent::BookingUpdate(_) => EventKind::BookingUpdate,
            RealtimeEvent::Notification(_) => EventKind::Notification,
        }
    }

    /// The payload in the JSON shape the rendering layer expects,
    /// e.g. `{"id": 42, "data": {"available": 3}}`.
    pub fn payload(&self) -> Value {
        match self {
            RealtimeEvent::ConnectionStatus(status) => json!({ "status": status }),
            RealtimeEvent::ParkingUpdate { id, data } => json!({ "id": id, "data": data }),
            RealtimeEvent::PriceUpdate { id, price } => json!({ "id": id, "price": price }),
            RealtimeEvent::BookingUpdate(payload) | RealtimeEvent::Notification(payload) => {
                payload.clone()
            }
        }
    }
}
