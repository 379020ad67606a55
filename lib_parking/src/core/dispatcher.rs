//! # Listener Dispatcher
//!
//! The `Dispatcher` is the fan-out point between the connection manager and
//! the rendering layer. Listeners register for one [`EventKind`] and get back
//! a [`ListenerId`] token; `off` consumes that token.
//!
//! ## Delivery rules:
//!
//! 1.  **Ordered**: listeners for an event run synchronously, in registration
//!     order, on the task that called `emit` (the manager task).
//!
//! 2.  **Isolated**: a listener that panics is caught and logged. Its siblings
//!     still run and the manager's message path is unaffected.
//!
//! 3.  **Idempotent registration**: registering the same `Arc` callback twice
//!     for the same kind returns the existing token instead of adding a
//!     duplicate.
//!
//! 4.  **Re-entrant**: the listener list is snapshotted before invocation, so
//!     listeners may call `on`/`off` without deadlocking. Changes take effect
//!     from the next `emit`.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::events::{EventKind, RealtimeEvent};

/// A registered callback.
pub type Listener = Arc<dyn Fn(&RealtimeEvent) + Send + Sync>;

/// Token identifying one registration, returned by `on` and consumed by `off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// One row in the listener table.
struct Registration {
    id: ListenerId,
    kind: EventKind,
    callback: Listener,
}

/// Event-kind keyed listener table.
pub struct Dispatcher {
    /// Registrations in insertion order. A single list keeps global
    /// registration order cheap to honour.
    listeners: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Creates a dispatcher with no listeners.
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    // Callbacks never run under this lock.
    fn table(&self) -> MutexGuard<'_, Vec<Registration>> {
        self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// # Register
    ///
    /// Adds `callback` for `kind` and returns its token. If the very same
    /// `Arc` is already registered for `kind`, the existing token is returned
    /// and nothing is added.
    pub fn on(&self, kind: EventKind, callback: Listener) -> ListenerId {
        let mut listeners = self.table();

        let existing = listeners.iter().find(|reg| {
            reg.kind == kind && std::ptr::addr_eq(Arc::as_ptr(&reg.callback), Arc::as_ptr(&callback))
        });
        if let Some(reg) = existing {
            log::debug!("Listener {:?} already registered for '{}'", reg.id, kind);
            return reg.id;
        }

        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        listeners.push(Registration { id, kind, callback });
        log::debug!("Listener {:?} registered for '{}'", id, kind);
        id
    }

    /// Convenience wrapper around [`Dispatcher::on`] for closures.
    pub fn on_fn<F>(&self, kind: EventKind, callback: F) -> ListenerId
    where
        F: Fn(&RealtimeEvent) + Send + Sync + 'static,
    {
        self.on(kind, Arc::new(callback))
    }

    /// # Unregister
    ///
    /// Removes the registration behind `id`. Returns whether anything was
    /// removed; unknown or already-removed tokens are a no-op.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.table();
        let before = listeners.len();
        listeners.retain(|reg| reg.id != id);
        let removed = listeners.len() != before;
        if removed {
            log::debug!("Listener {:?} removed", id);
        }
        removed
    }

    /// Number of listeners currently registered for `kind`.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.table().iter().filter(|reg| reg.kind == kind).count()
    }

    /// # Emit
    ///
    /// Invokes every listener registered for the event's kind, in
    /// registration order. Returns how many listeners completed without
    /// panicking.
    pub fn emit(&self, event: &RealtimeEvent) -> usize {
        let kind = event.kind();
        let targets: Vec<(ListenerId, Listener)> = self
            .table()
            .iter()
            .filter(|reg| reg.kind == kind)
            .map(|reg| (reg.id, Arc::clone(&reg.callback)))
            .collect();

        let mut delivered = 0;
        for (id, callback) in targets {
            match panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(()) => delivered += 1,
                Err(cause) => {
                    let reason = cause
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| cause.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    log::error!("Listener {:?} for '{}' panicked: {}", id, kind, reason);
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::envelope::{LotId, Price};
    use crate::core::events::ConnectionStatus;

    fn price_event(price: f64) -> RealtimeEvent {
        RealtimeEvent::PriceUpdate { id: LotId::Int(1), price: Price::from(price) }
    }

    fn recorder() -> (Arc<Mutex<Vec<RealtimeEvent>>>, Listener) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener: Listener = Arc::new(move |event: &RealtimeEvent| {
            sink.lock().unwrap().push(event.clone());
        });
        (seen, listener)
    }

    #[test]
    fn test_listener_invoked_once_per_emit_with_exact_payload() {
        let dispatcher = Dispatcher::new();
        let (seen, listener) = recorder();
        dispatcher.on(EventKind::PriceUpdate, listener);

        for price in [1.0, 2.5, 4.0] {
            assert_eq!(dispatcher.emit(&price_event(price)), 1);
        }

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![price_event(1.0), price_event(2.5), price_event(4.0)]);
    }

    #[test]
    fn test_off_stops_delivery_and_unknown_off_is_noop() {
        let dispatcher = Dispatcher::new();
        let (seen, listener) = recorder();
        let id = dispatcher.on(EventKind::PriceUpdate, listener);

        assert!(dispatcher.off(id));
        assert!(!dispatcher.off(id));
        assert!(!dispatcher.off(ListenerId(9_999)));

        assert_eq!(dispatcher.emit(&price_event(1.0)), 0);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_same_callback_registered_twice_is_deduplicated() {
        let dispatcher = Dispatcher::new();
        let (seen, listener) = recorder();

        let first = dispatcher.on(EventKind::PriceUpdate, Arc::clone(&listener));
        let second = dispatcher.on(EventKind::PriceUpdate, Arc::clone(&listener));
        assert_eq!(first, second);
        assert_eq!(dispatcher.listener_count(EventKind::PriceUpdate), 1);

        // Same callback under another kind is a separate registration.
        let other = dispatcher.on(EventKind::ParkingUpdate, listener);
        assert_ne!(first, other);

        dispatcher.emit(&price_event(1.0));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_only_matching_kind_is_invoked() {
        let dispatcher = Dispatcher::new();
        let (seen, listener) = recorder();
        dispatcher.on(EventKind::Notification, listener);

        dispatcher.emit(&RealtimeEvent::ConnectionStatus(ConnectionStatus::Connected));
        dispatcher.emit(&price_event(1.0));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_listeners_run_in_registration_order() {
        let dispatcher = Dispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            dispatcher.on_fn(EventKind::PriceUpdate, move |_| order.lock().unwrap().push(tag));
        }

        dispatcher.emit(&price_event(1.0));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_panicking_listener_does_not_block_siblings() {
        let dispatcher = Dispatcher::new();
        let (before, first) = recorder();
        let (after, last) = recorder();

        dispatcher.on(EventKind::PriceUpdate, first);
        dispatcher.on_fn(EventKind::PriceUpdate, |_| panic!("listener blew up"));
        dispatcher.on(EventKind::PriceUpdate, last);

        assert_eq!(dispatcher.emit(&price_event(1.0)), 2);
        assert_eq!(dispatcher.emit(&price_event(2.0)), 2);
        assert_eq!(before.lock().unwrap().len(), 2);
        assert_eq!(after.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_listener_can_unregister_itself_during_emit() {
        let dispatcher = Arc::new(Dispatcher::new());
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(AtomicU64::new(0));

        let handle = Arc::clone(&dispatcher);
        let own_slot = Arc::clone(&slot);
        let counter = Arc::clone(&calls);
        let id = dispatcher.on_fn(EventKind::PriceUpdate, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = *own_slot.lock().unwrap() {
                handle.off(id);
            }
        });
        *slot.lock().unwrap() = Some(id);

        dispatcher.emit(&price_event(1.0));
        dispatcher.emit(&price_event(2.0));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
