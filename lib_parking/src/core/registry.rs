//! # Topic Registry
//!
//! Holds the two pieces of per-session state the manager task owns:
//!
//! - the **entity cache**, last-known attributes per lot, mutated only by
//!   applying incoming messages;
//! - the **subscription intent**, the lots the client wants streamed. It is
//!   independent of the transport session and is replayed after every open.
//!
//! `apply` turns one decoded message into at most one local event, updating
//! the cache first so listeners always observe the new state.

use std::collections::{BTreeSet, HashMap};

use crate::core::envelope::{LotId, ServerMessage};
use crate::core::events::{LotSnapshot, RealtimeEvent};

/// Per-lot cache and subscription intent.
#[derive(Debug, Default)]
pub struct Registry {
    lots: HashMap<LotId, LotSnapshot>,
    intent: BTreeSet<LotId>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a lot to the subscription intent.
    ///
    /// Returns `true` when the lot was not already wanted, i.e. when a
    /// `subscribe` message should go out.
    pub fn subscribe(&mut self, id: LotId) -> bool {
        self.intent.insert(id)
    }

    /// Removes a lot from the subscription intent.
    ///
    /// Returns `true` when the lot was wanted, i.e. when an `unsubscribe`
    /// message should go out. Unknown ids are a no-op.
    pub fn unsubscribe(&mut self, id: &LotId) -> bool {
        self.intent.remove(id)
    }

    /// The current subscription intent, in id order.
    pub fn subscriptions(&self) -> impl Iterator<Item = &LotId> {
        self.intent.iter()
    }

    /// Whether a lot is in the subscription intent.
    pub fn is_subscribed(&self, id: &LotId) -> bool {
        self.intent.contains(id)
    }

    /// Cached attributes for a lot.
    pub fn lot(&self, id: &LotId) -> Option<&LotSnapshot> {
        self.lots.get(id)
    }

    /// Number of lots seen this session.
    pub fn len(&self) -> usize {
        self.lots.len()
    }

    /// Whether no lot has been seen yet.
    pub fn is_empty(&self) -> bool {
        self.lots.is_empty()
    }

    /// Applies one decoded message.
    ///
    /// `focus` is the lot bound to a per-lot channel; `initial_data` and
    /// `spot_update` carry no id of their own and are attributed to it.
    pub fn apply(&mut self, message: ServerMessage, focus: Option<&LotId>) -> Option<RealtimeEvent> {
        match message {
            ServerMessage::ParkingUpdate { parking_lot_id, data } => {
                let snapshot = LotSnapshot::new(data);
                self.lots.insert(parking_lot_id.clone(), snapshot.clone());
                Some(RealtimeEvent::ParkingUpdate { id: parking_lot_id, data: snapshot })
            }
            ServerMessage::PriceUpdate { parking_lot_id, price } => {
                match self.lots.get_mut(&parking_lot_id) {
                    Some(lot) => {
                        lot.set_price(price.clone());
                        Some(RealtimeEvent::PriceUpdate { id: parking_lot_id, price })
                    }
                    None => {
                        log::debug!("Ignoring price_update for uncached lot {}", parking_lot_id);
                        None
                    }
                }
            }
            ServerMessage::BookingStatus(payload) => Some(RealtimeEvent::BookingUpdate(payload)),
            ServerMessage::Notification(payload) => Some(RealtimeEvent::Notification(payload)),
            ServerMessage::InitialData { parking_lot, spots } => {
                let id = focus
                    .cloned()
                    .or_else(|| parking_lot.get("id").and_then(LotId::from_value));
                let Some(id) = id else {
                    log::warn!("Dropping initial_data without a lot id");
                    return None;
                };
                let snapshot = LotSnapshot::with_spots(parking_lot, spots);
                self.lots.insert(id.clone(), snapshot.clone());
                Some(RealtimeEvent::ParkingUpdate { id, data: snapshot })
            }
            ServerMessage::SpotUpdate { spots } => {
                let Some(id) = focus else {
                    log::warn!("Dropping spot_update received outside a per-lot channel");
                    return None;
                };
                let Some(lot) = self.lots.get_mut(id) else {
                    log::debug!("Ignoring spot_update for lot {} before initial_data", id);
                    return None;
                };
                let merged = lot.merge_spots(&spots);
                log::trace!("Merged {} of {} spot patches into lot {}", merged, spots.len(), id);
                Some(RealtimeEvent::ParkingUpdate { id: id.clone(), data: lot.clone() })
            }
            ServerMessage::Unrecognized { kind } => {
                log::debug!("Ignoring unrecognized message kind '{}'", kind);
                None
            }
        }
    }
}
