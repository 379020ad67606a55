//! # Wire Envelope
//!
//! Every frame on the parking channel is a JSON object carrying a `type` tag
//! and tag-specific fields. Outgoing control messages serialize straight from
//! [`ClientMessage`]. Incoming frames go through [`ServerMessage::decode`],
//! which checks the shape of each known tag and maps unknown tags to
//! [`ServerMessage::Unrecognized`] instead of failing.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Identifier of a parking lot.
///
/// The backend treats ids as opaque and may send either integers or strings,
/// so both are kept as-is. An integer `42` and a string `"42"` are distinct
/// keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LotId {
    /// Numeric primary key.
    Int(i64),
    /// Any other opaque identifier.
    Str(String),
}

impl LotId {
    /// Reads a lot id out of a JSON value, accepting integers and strings.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(LotId::Int),
            Value::String(s) => Some(LotId::Str(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for LotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LotId::Int(n) => write!(f, "{}", n),
            LotId::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for LotId {
    fn from(n: i64) -> Self {
        LotId::Int(n)
    }
}

impl From<&str> for LotId {
    fn from(s: &str) -> Self {
        LotId::Str(s.to_string())
    }
}

impl From<String> for LotId {
    fn from(s: String) -> Self {
        LotId::Str(s)
    }
}

impl FromStr for LotId {
    type Err = std::convert::Infallible;

    /// Command-line and config input: digits become `Int`, anything else `Str`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(s.parse::<i64>().map(LotId::Int).unwrap_or_else(|_| LotId::Str(s.to_string())))
    }
}

/// Control messages sent from the client to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keeps intermediaries from reclaiming an idle connection.
    Heartbeat,
    /// Ask the server to stream updates for a lot.
    Subscribe {
        /// Lot to stream.
        parking_lot_id: LotId,
    },
    /// Stop streaming updates for a lot.
    Unsubscribe {
        /// Lot to stop streaming.
        parking_lot_id: LotId,
    },
}

impl ClientMessage {
    /// Serializes the message into the text frame sent on the wire.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Why an incoming frame was rejected.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The frame is not valid JSON.
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame is JSON but not an object.
    #[error("frame is not a JSON object")]
    NotAnObject,

    /// The object has no `type` field.
    #[error("frame has no 'type' field")]
    MissingType,

    /// The `type` field is present but not a string.
    #[error("frame 'type' field is not a string")]
    InvalidType,

    /// A known message kind had fields of the wrong shape.
    #[error("malformed '{kind}' message: {source}")]
    Shape {
        /// The message kind being decoded.
        kind: String,
        /// The underlying field error.
        #[source]
        source: serde_json::Error,
    },

    /// A `price_update` carried a price that is neither a number nor a numeric string.
    #[error("price_update has a non-numeric price: {0}")]
    InvalidPrice(Value),
}

/// A price exactly as the server sent it.
///
/// Decimal fields arrive either as JSON numbers or as numeric strings
/// (`"5.50"`). The wire value is kept untouched so cached and emitted
/// payloads match what the server sent; [`Price::as_f64`] gives the numeric
/// reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Price(Value);

impl Price {
    /// Accepts a JSON number or a string holding a finite number.
    pub fn from_value(value: Value) -> Option<Self> {
        parse_price(&value).map(|_| Self(value))
    }

    /// The numeric reading of the price.
    pub fn as_f64(&self) -> f64 {
        parse_price(&self.0).unwrap_or(f64::NAN)
    }

    /// The value as received.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Unwraps the value as received.
    pub fn into_value(self) -> Value {
        self.0
    }
}

impl From<f64> for Price {
    fn from(price: f64) -> Self {
        Self(Value::from(price))
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Value::String(s) => f.write_str(s),
            other => write!(f, "{}", other),
        }
    }
}

/// Messages received from the server, on either the multiplexed or the per-lot channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Fresh attributes for a lot.
    ParkingUpdate {
        /// Lot the update belongs to.
        parking_lot_id: LotId,
        /// Replacement attributes.
        data: Map<String, Value>,
    },
    /// Booking state change; the full payload is passed through.
    BookingStatus(Value),
    /// User-facing notification; the full payload is passed through.
    Notification(Value),
    /// New price for a lot.
    PriceUpdate {
        /// Lot the price belongs to.
        parking_lot_id: LotId,
        /// New price, as sent.
        price: Price,
    },
    /// Snapshot sent once when a per-lot channel opens.
    InitialData {
        /// Lot attributes.
        parking_lot: Map<String, Value>,
        /// Every spot in the lot.
        spots: Vec<Map<String, Value>>,
    },
    /// Partial spot patches on a per-lot channel, keyed by spot `id`.
    SpotUpdate {
        /// Patches to merge into the cached spots.
        spots: Vec<Map<String, Value>>,
    },
    /// A well-formed envelope with a tag this client does not handle.
    Unrecognized {
        /// The unknown `type` value.
        kind: String,
    },
}

#[derive(Deserialize)]
struct ParkingUpdateBody {
    parking_lot_id: LotId,
    data: Map<String, Value>,
}

#[derive(Deserialize)]
struct PriceUpdateBody {
    parking_lot_id: LotId,
    price: Value,
}

#[derive(Deserialize)]
struct InitialDataBody {
    parking_lot: Map<String, Value>,
    #[serde(default)]
    spots: Vec<Map<String, Value>>,
}

#[derive(Deserialize)]
struct SpotUpdateBody {
    spots: Vec<Map<String, Value>>,
}

impl ServerMessage {
    /// Decodes one text frame.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Decodes an already-parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let kind = match value.as_object() {
            None => return Err(DecodeError::NotAnObject),
            Some(obj) => match obj.get("type") {
                Some(Value::String(kind)) => kind.clone(),
                Some(_) => return Err(DecodeError::InvalidType),
                None => return Err(DecodeError::MissingType),
            },
        };

        match kind.as_str() {
            "parking_update" => {
                let body: ParkingUpdateBody = shape(&kind, value)?;
                Ok(ServerMessage::ParkingUpdate {
                    parking_lot_id: body.parking_lot_id,
                    data: body.data,
                })
            }
            "booking_status" => Ok(ServerMessage::BookingStatus(value)),
            "notification" => Ok(ServerMessage::Notification(value)),
            "price_update" => {
                let body: PriceUpdateBody = shape(&kind, value)?;
                if parse_price(&body.price).is_none() {
                    return Err(DecodeError::InvalidPrice(body.price));
                }
                let price = Price(body.price);
                Ok(ServerMessage::PriceUpdate {
                    parking_lot_id: body.parking_lot_id,
                    price,
                })
            }
            "initial_data" => {
                let body: InitialDataBody = shape(&kind, value)?;
                Ok(ServerMessage::InitialData {
                    parking_lot: body.parking_lot,
                    spots: body.spots,
                })
            }
            "spot_update" => {
                let body: SpotUpdateBody = shape(&kind, value)?;
                Ok(ServerMessage::SpotUpdate { spots: body.spots })
            }
            _ => Ok(ServerMessage::Unrecognized { kind }),
        }
    }

    /// The wire `type` tag of this message.
    pub fn kind(&self) -> &str {
        match self {
            ServerMessage::ParkingUpdate { .. } => "parking_update",
            ServerMessage::BookingStatus(_) => "booking_status",
            ServerMessage::Notification(_) => "notification",
            ServerMessage::PriceUpdate { .. } => "price_update",
            ServerMessage::InitialData { .. } => "initial_data",
            ServerMessage::SpotUpdate { .. } => "spot_update",
            ServerMessage::Unrecognized { kind } => kind,
        }
    }
}

fn shape<T: DeserializeOwned>(kind: &str, value: Value) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|source| DecodeError::Shape {
        kind: kind.to_string(),
        source,
    })
}

// Decimal fields may arrive serialized as strings.
pub(crate) fn parse_price(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|p| p.is_finite()),
        _ => None,
    }
}
