//! # Connection Manager
//!
//! One tokio task owns the transport session, the [`Registry`] and every
//! timer. [`RealtimeClient`](crate::core::RealtimeClient) handles talk to it
//! over an unbounded command channel, so all state changes happen on a
//! single task and never race.
//!
//! ## Lifecycle
//!
//! ```text
//!  Idle --start--> Connecting --open--> Open --stop--> Closing --> Closed
//!                      |                  |
//!                      +--fail--+  +--lost+
//!                               v  v
//!                              Closed --(backoff N x base)--> Connecting
//! ```
//!
//! - Every exit from `Connecting` or `Open` emits one `disconnected`.
//! - Reconnect attempt `N` waits `N x reconnect_base_delay`. When the
//!   attempts are used up, `failed` is emitted once and the task goes
//!   dormant until the next `start()`.
//! - A successful open resets the attempt counter, emits `connected` and
//!   replays the subscription intent before anything else is sent.
//! - Heartbeats go out every `heartbeat_interval` while `Open`, the first
//!   one a full interval after the open.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use url::Url;

use crate::core::client::RealtimeConfig;
use crate::core::dispatcher::Dispatcher;
use crate::core::envelope::{ClientMessage, LotId, ServerMessage};
use crate::core::error::RealtimeError;
use crate::core::events::{ConnectionStatus, LotSnapshot, RealtimeEvent};
use crate::core::registry::Registry;
use crate::core::transport::{Channel, Connector, Frame, TransportSession};

/// Observable lifecycle state of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Never started.
    Idle,
    /// A connect attempt is in flight.
    Connecting,
    /// The transport is open.
    Open,
    /// An explicit stop is closing the transport.
    Closing,
    /// Not connected: stopped, failed, or waiting to reconnect.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        })
    }
}

/// Requests sent from client handles to the manager task.
#[derive(Debug)]
pub(crate) enum Command {
    Start,
    Stop,
    Send(ClientMessage),
    Subscribe(LotId),
    Unsubscribe(LotId),
    Lot { id: LotId, reply: oneshot::Sender<Option<LotSnapshot>> },
    Subscriptions { reply: oneshot::Sender<Vec<LotId>> },
}

/// Lifecycle requests extracted from a command.
enum Lifecycle {
    Start,
    Stop,
}

/// Where the run loop goes next.
enum Phase<S> {
    /// Idle or closed, waiting for `start()`.
    Dormant,
    Connecting,
    Open(S),
    /// Closed, waiting to reconnect.
    Backoff(Duration),
    /// Every client handle is gone.
    Exit,
}

/// Owns the connection and everything that depends on it.
pub(crate) struct ConnectionManager<C: Connector> {
    connector: C,
    endpoint: Url,
    channel: Channel,
    heartbeat_interval: Duration,
    reconnect_base_delay: Duration,
    max_reconnect_attempts: u32,
    reconnect_attempts: u32,
    registry: Registry,
    dispatcher: Arc<Dispatcher>,
    state: watch::Sender<ConnectionState>,
}

impl<C: Connector> ConnectionManager<C> {
    pub(crate) fn new(
        connector: C,
        endpoint: Url,
        config: &RealtimeConfig,
        dispatcher: Arc<Dispatcher>,
        state: watch::Sender<ConnectionState>,
    ) -> Self {
        let mut registry = Registry::new();
        // A per-lot channel is subscribed to its lot by construction.
        if let Some(id) = config.channel.focus() {
            registry.subscribe(id.clone());
        }

        Self {
            connector,
            endpoint,
            channel: config.channel.clone(),
            heartbeat_interval: config.heartbeat_interval,
            reconnect_base_delay: config.reconnect_base_delay,
            max_reconnect_attempts: config.max_reconnect_attempts,
            reconnect_attempts: 0,
            registry,
            dispatcher,
            state,
        }
    }

    /// Drives the connection until every client handle has been dropped.
    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut phase = Phase::Dormant;
        loop {
            phase = match phase {
                Phase::Dormant => self.dormant(&mut commands).await,
                Phase::Connecting => self.connect(&mut commands).await,
                Phase::Open(session) => self.serve(session, &mut commands).await,
                Phase::Backoff(delay) => self.back_off(delay, &mut commands).await,
                Phase::Exit => break,
            };
        }
        log::debug!("Connection manager for {} finished", self.endpoint);
    }

    async fn dormant(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) -> Phase<C::Session> {
        loop {
            let Some(command) = commands.recv().await else {
                return Phase::Exit;
            };
            match self.handle(command, None).await {
                Some(Lifecycle::Start) => {
                    self.reconnect_attempts = 0;
                    return Phase::Connecting;
                }
                Some(Lifecycle::Stop) => log::debug!("stop() while not connected, nothing to do"),
                None => {}
            }
        }
    }

    async fn connect(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) -> Phase<C::Session> {
        self.set_state(ConnectionState::Connecting);
        log::info!("Connecting to {}", self.endpoint);

        let connector = self.connector.clone();
        let endpoint = self.endpoint.clone();
        let attempt = async move { connector.connect(&endpoint).await };
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                result = &mut attempt => {
                    return match result {
                        Ok(session) => self.on_open(session).await,
                        Err(e) => {
                            log::warn!("Connection to {} failed: {}", self.endpoint, e);
                            self.on_lost()
                        }
                    };
                }
                command = commands.recv() => {
                    let Some(command) = command else {
                        return Phase::Exit;
                    };
                    match self.handle(command, None).await {
                        Some(Lifecycle::Start) => log::debug!("start() ignored, already connecting"),
                        Some(Lifecycle::Stop) => {
                            log::info!("Connect attempt to {} abandoned by stop()", self.endpoint);
                            self.set_state(ConnectionState::Closed);
                            self.emit_status(ConnectionStatus::Disconnected);
                            return Phase::Dormant;
                        }
                        None => {}
                    }
                }
            }
        }
    }

    async fn on_open(&mut self, mut session: C::Session) -> Phase<C::Session> {
        log::info!("Connected to {}", self.endpoint);
        self.reconnect_attempts = 0;
        self.set_state(ConnectionState::Open);
        self.emit_status(ConnectionStatus::Connected);

        if self.channel.sends_control_frames() {
            let wanted: Vec<LotId> = self.registry.subscriptions().cloned().collect();
            for id in &wanted {
                let message = ClientMessage::Subscribe { parking_lot_id: id.clone() };
                if let Err(e) = Self::transmit(&mut session, &message).await {
                    log::warn!("Failed to resubscribe to lot {}: {}", id, e);
                }
            }
            if !wanted.is_empty() {
                log::info!("Replayed {} subscription(s)", wanted.len());
            }
        }

        Phase::Open(session)
    }

    async fn serve(
        &mut self,
        mut session: C::Session,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Phase<C::Session> {
        let heartbeat_enabled = !self.heartbeat_interval.is_zero();
        let period = self.heartbeat_interval.max(Duration::from_millis(1));
        let mut heartbeat = time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                command = commands.recv() => {
                    let Some(command) = command else {
                        self.close(&mut session).await;
                        return Phase::Exit;
                    };
                    match self.handle(command, Some(&mut session)).await {
                        Some(Lifecycle::Start) => log::debug!("start() ignored, already open"),
                        Some(Lifecycle::Stop) => {
                            self.close(&mut session).await;
                            return Phase::Dormant;
                        }
                        None => {}
                    }
                }
                frame = session.next_frame() => match frame {
                    Some(Ok(Frame::Text(text))) => self.on_text(&text),
                    Some(Ok(Frame::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => self.on_text(&text),
                        Err(_) => log::warn!("Dropping binary frame that is not UTF-8"),
                    },
                    Some(Err(e)) => {
                        log::warn!("Connection to {} lost: {}", self.endpoint, e);
                        return self.on_lost();
                    }
                    None => {
                        log::warn!("Connection to {} closed by server", self.endpoint);
                        return self.on_lost();
                    }
                },
                _ = heartbeat.tick(), if heartbeat_enabled => {
                    if let Err(e) = Self::transmit(&mut session, &ClientMessage::Heartbeat).await {
                        log::debug!("Heartbeat not sent: {}", e);
                    }
                }
            }
        }
    }

    async fn back_off(
        &mut self,
        delay: Duration,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Phase<C::Session> {
        let timer = time::sleep(delay);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = &mut timer => return Phase::Connecting,
                command = commands.recv() => {
                    let Some(command) = command else {
                        return Phase::Exit;
                    };
                    match self.handle(command, None).await {
                        Some(Lifecycle::Start) => {
                            log::info!("start() during backoff, reconnecting now");
                            self.reconnect_attempts = 0;
                            return Phase::Connecting;
                        }
                        Some(Lifecycle::Stop) => {
                            log::info!("Pending reconnect cancelled by stop()");
                            return Phase::Dormant;
                        }
                        None => {}
                    }
                }
            }
        }
    }

    /// Handles commands that do not change the lifecycle and hands the rest
    /// back. `session` is the open transport, if there is one.
    async fn handle(&mut self, command: Command, session: Option<&mut C::Session>) -> Option<Lifecycle> {
        match command {
            Command::Start => return Some(Lifecycle::Start),
            Command::Stop => return Some(Lifecycle::Stop),
            Command::Send(message) => match session {
                Some(session) => {
                    if let Err(e) = Self::transmit(session, &message).await {
                        log::warn!("Failed to send {:?}: {}", message, e);
                    }
                }
                None => log::debug!("Not connected, dropping {:?}", message),
            },
            Command::Subscribe(id) => {
                if self.registry.subscribe(id.clone()) && self.channel.sends_control_frames() {
                    if let Some(session) = session {
                        let message = ClientMessage::Subscribe { parking_lot_id: id.clone() };
                        if let Err(e) = Self::transmit(session, &message).await {
                            log::warn!("Failed to subscribe to lot {}: {}", id, e);
                        }
                    }
                }
            }
            Command::Unsubscribe(id) => {
                if self.registry.unsubscribe(&id) && self.channel.sends_control_frames() {
                    if let Some(session) = session {
                        let message = ClientMessage::Unsubscribe { parking_lot_id: id.clone() };
                        if let Err(e) = Self::transmit(session, &message).await {
                            log::warn!("Failed to unsubscribe from lot {}: {}", id, e);
                        }
                    }
                }
            }
            Command::Lot { id, reply } => {
                let _ = reply.send(self.registry.lot(&id).cloned());
            }
            Command::Subscriptions { reply } => {
                let _ = reply.send(self.registry.subscriptions().cloned().collect());
            }
        }
        None
    }

    fn on_text(&mut self, text: &str) {
        match ServerMessage::decode(text) {
            Ok(message) => {
                log::trace!("Received '{}'", message.kind());
                if let Some(event) = self.registry.apply(message, self.channel.focus()) {
                    self.dispatcher.emit(&event);
                }
            }
            Err(e) => log::warn!("Dropping malformed frame: {}", e),
        }
    }

    /// The transport went away without a stop. Schedules the next attempt
    /// or gives up.
    fn on_lost(&mut self) -> Phase<C::Session> {
        self.set_state(ConnectionState::Closed);
        self.emit_status(ConnectionStatus::Disconnected);

        if self.reconnect_attempts >= self.max_reconnect_attempts {
            log::error!(
                "Giving up on {} after {} reconnect attempt(s)",
                self.endpoint,
                self.reconnect_attempts
            );
            self.emit_status(ConnectionStatus::Failed);
            return Phase::Dormant;
        }

        self.reconnect_attempts += 1;
        let delay = backoff_delay(self.reconnect_base_delay, self.reconnect_attempts);
        log::info!(
            "Reconnecting in {:?} (attempt {}/{})",
            delay,
            self.reconnect_attempts,
            self.max_reconnect_attempts
        );
        Phase::Backoff(delay)
    }

    async fn close(&mut self, session: &mut C::Session) {
        self.set_state(ConnectionState::Closing);
        session.close().await;
        self.set_state(ConnectionState::Closed);
        self.emit_status(ConnectionStatus::Disconnected);
        log::info!("Disconnected from {}", self.endpoint);
    }

    async fn transmit(session: &mut C::Session, message: &ClientMessage) -> Result<(), RealtimeError> {
        let text = message
            .encode()
            .map_err(|e| RealtimeError::Transport(e.to_string()))?;
        session.send_text(text).await
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            log::debug!("Connection state {} -> {}", previous, next);
        }
    }

    fn emit_status(&self, status: ConnectionStatus) {
        self.dispatcher.emit(&RealtimeEvent::ConnectionStatus(status));
    }
}

/// Wait before reconnect attempt `attempt` (1-indexed). Saturates at
/// `Duration::MAX`, which the timer treats as "far future".
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(attempt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::client::RealtimeClient;
    use crate::core::events::EventKind;
    use crate::core::transport::mock::MockConnector;
    use serde_json::json;

    fn config() -> RealtimeConfig {
        RealtimeConfig { origin: "https://parking.example.com".to_string(), ..RealtimeConfig::default() }
    }

    /// Client wired to `connector`, plus a stream of every event it emits.
    fn client_with(
        config: RealtimeConfig,
        connector: &MockConnector,
    ) -> (RealtimeClient, mpsc::UnboundedReceiver<RealtimeEvent>) {
        let client = RealtimeClient::with_connector(config, connector.clone()).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        for kind in EventKind::ALL {
            let tx = tx.clone();
            client.on(kind, move |event| {
                let _ = tx.send(event.clone());
            });
        }
        (client, rx)
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<RealtimeEvent>) -> RealtimeEvent {
        time::timeout(Duration::from_secs(600), events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event stream closed")
    }

    fn status(status: ConnectionStatus) -> RealtimeEvent {
        RealtimeEvent::ConnectionStatus(status)
    }

    fn subscribe(id: i64) -> ClientMessage {
        ClientMessage::Subscribe { parking_lot_id: LotId::Int(id) }
    }

    /// Lets the manager task drain its queue without moving the clock.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_parking_then_price_update_reach_listeners_and_cache() {
        let connector = MockConnector::new();
        let mut server = connector.push_session();
        let (client, mut events) = client_with(config(), &connector);

        client.subscribe(LotId::Int(42)).unwrap();
        client.start().unwrap();
        assert_eq!(next_event(&mut events).await, status(ConnectionStatus::Connected));
        assert_eq!(client.state(), ConnectionState::Open);
        settle().await;
        assert_eq!(server.drain_sent(), vec![subscribe(42)]);

        server.push(r#"{"type":"parking_update","parking_lot_id":42,"data":{"available":3}}"#);
        server.push(r#"{"type":"price_update","parking_lot_id":42,"price":"5.5"}"#);

        let first = next_event(&mut events).await;
        assert_eq!(first.payload(), json!({"id": 42, "data": {"available": 3}}));
        let second = next_event(&mut events).await;
        assert_eq!(second.payload(), json!({"id": 42, "price": "5.5"}));

        let cached = client.lot(LotId::Int(42)).await.unwrap().unwrap();
        assert_eq!(cached.get("available"), Some(&json!(3)));
        assert_eq!(cached.get("price"), Some(&json!("5.5")));
        assert_eq!(cached.price(), Some(5.5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_price_for_unknown_lot_and_malformed_frames_are_dropped() {
        let connector = MockConnector::new();
        let server = connector.push_session();
        let (client, mut events) = client_with(config(), &connector);

        client.start().unwrap();
        assert_eq!(next_event(&mut events).await, status(ConnectionStatus::Connected));

        server.push(r#"{"type":"price_update","parking_lot_id":99,"price":3.0}"#);
        server.push("{{{ not json");
        server.push(r#"{"type":"parking_update","parking_lot_id":1,"data":5}"#);
        server.push(r#"{"no_type":true}"#);
        server.push_binary(&[0xff, 0xfe]);
        server.push(r#"{"type":"notification","message":"Welcome"}"#);

        let event = next_event(&mut events).await;
        assert_eq!(event, RealtimeEvent::Notification(json!({"type": "notification", "message": "Welcome"})));
        assert!(client.lot(LotId::Int(99)).await.unwrap().is_none());
        assert_eq!(client.state(), ConnectionState::Open);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_listener_does_not_stop_siblings_or_connection() {
        let connector = MockConnector::new();
        let server = connector.push_session();
        let client = RealtimeClient::with_connector(config(), connector.clone()).unwrap();

        client.on(EventKind::ParkingUpdate, |_| panic!("listener blew up"));
        let (tx, mut updates) = mpsc::unbounded_channel();
        client.on(EventKind::ParkingUpdate, move |event| {
            let _ = tx.send(event.clone());
        });
        let mut state = client.watch_state();

        client.start().unwrap();
        state.wait_for(|s| *s == ConnectionState::Open).await.unwrap();

        server.push(r#"{"type":"parking_update","parking_lot_id":1,"data":{"available":4}}"#);
        server.push(r#"{"type":"parking_update","parking_lot_id":1,"data":{"available":2}}"#);

        let first = next_event(&mut updates).await;
        assert_eq!(first.payload(), json!({"id": 1, "data": {"available": 4}}));
        let second = next_event(&mut updates).await;
        assert_eq!(second.payload(), json!({"id": 1, "data": {"available": 2}}));

        assert_eq!(client.state(), ConnectionState::Open);
        let cached = client.lot(LotId::Int(1)).await.unwrap().unwrap();
        assert_eq!(cached.get("available"), Some(&json!(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_intent_is_replayed_once_per_open() {
        let connector = MockConnector::new();
        let mut first = connector.push_session();
        let mut second = connector.push_session();
        let (client, mut events) = client_with(config(), &connector);

        client.subscribe(LotId::Int(2)).unwrap();
        client.subscribe(LotId::Int(1)).unwrap();
        client.subscribe(LotId::Int(2)).unwrap();
        client.unsubscribe(LotId::Int(3)).unwrap();
        client.start().unwrap();
        assert_eq!(next_event(&mut events).await, status(ConnectionStatus::Connected));
        settle().await;
        assert_eq!(first.drain_sent(), vec![subscribe(1), subscribe(2)]);

        // While open, only real changes go out.
        client.subscribe(LotId::Int(5)).unwrap();
        client.subscribe(LotId::Int(5)).unwrap();
        settle().await;
        assert_eq!(first.drain_sent(), vec![subscribe(5)]);

        drop(first);
        assert_eq!(next_event(&mut events).await, status(ConnectionStatus::Disconnected));

        // Changes while disconnected only touch the intent.
        client.subscribe(LotId::Int(7)).unwrap();
        client.unsubscribe(LotId::Int(1)).unwrap();
        assert_eq!(
            client.subscriptions().await.unwrap(),
            vec![LotId::Int(2), LotId::Int(5), LotId::Int(7)]
        );

        assert_eq!(next_event(&mut events).await, status(ConnectionStatus::Connected));
        client.send(ClientMessage::Heartbeat).unwrap();
        settle().await;
        assert_eq!(
            second.drain_sent(),
            vec![subscribe(2), subscribe(5), subscribe(7), ClientMessage::Heartbeat]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_while_open_sends_control_frame() {
        let connector = MockConnector::new();
        let mut server = connector.push_session();
        let (client, mut events) = client_with(config(), &connector);

        client.subscribe(LotId::Int(4)).unwrap();
        client.start().unwrap();
        assert_eq!(next_event(&mut events).await, status(ConnectionStatus::Connected));

        client.unsubscribe(LotId::Int(4)).unwrap();
        client.unsubscribe(LotId::Int(4)).unwrap();
        settle().await;
        assert_eq!(
            server.drain_sent(),
            vec![subscribe(4), ClientMessage::Unsubscribe { parking_lot_id: LotId::Int(4) }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_backoff_is_linear_and_fails_once() {
        let connector = MockConnector::new();
        let first = connector.push_session();
        let second = connector.push_session();
        for _ in 0..5 {
            connector.push_refusal();
        }
        let (client, mut events) = client_with(config(), &connector);

        client.start().unwrap();
        assert_eq!(next_event(&mut events).await, status(ConnectionStatus::Connected));
        drop(first);
        assert_eq!(next_event(&mut events).await, status(ConnectionStatus::Disconnected));
        assert_eq!(next_event(&mut events).await, status(ConnectionStatus::Connected));
        drop(second);

        // The close of the second session plus five refused attempts.
        for _ in 0..6 {
            assert_eq!(next_event(&mut events).await, status(ConnectionStatus::Disconnected));
        }
        assert_eq!(next_event(&mut events).await, status(ConnectionStatus::Failed));

        time::sleep(Duration::from_secs(600)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(client.state(), ConnectionState::Closed);

        let times = connector.attempt_times();
        assert_eq!(times.len(), 7);
        let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
        let expected = [5, 5, 10, 15, 20, 25];
        for (gap, secs) in gaps.iter().zip(expected) {
            let wanted = Duration::from_secs(secs);
            assert!(
                *gap >= wanted && *gap < wanted + Duration::from_millis(50),
                "gap {:?}, expected {:?}",
                gap,
                wanted
            );
        }
    }

    #[test]
    fn test_backoff_delay_is_linear_and_saturates() {
        let base = Duration::from_secs(5);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(5));
        assert_eq!(backoff_delay(base, 5), Duration::from_secs(25));
        assert_eq!(backoff_delay(Duration::MAX, 2), Duration::MAX);
        assert_eq!(backoff_delay(Duration::from_secs(u64::MAX / 2 + 1), 2), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_reconnect_delay_keeps_manager_alive() {
        let connector = MockConnector::new();
        let server = connector.push_session();
        connector.push_refusal();
        connector.push_refusal();
        let config = RealtimeConfig {
            reconnect_base_delay: Duration::from_secs(u64::MAX / 2 + 1),
            max_reconnect_attempts: u32::MAX,
            ..config()
        };
        let (client, mut events) = client_with(config, &connector);

        client.subscribe(LotId::Int(1)).unwrap();
        client.start().unwrap();
        assert_eq!(next_event(&mut events).await, status(ConnectionStatus::Connected));
        drop(server);
        assert_eq!(next_event(&mut events).await, status(ConnectionStatus::Disconnected));

        // The first delay is clamped by the timer; the second one overflows
        // a plain multiplication.
        let decade = Duration::from_secs(10 * 365 * 24 * 3600);
        for _ in 0..100 {
            if connector.attempt_times().len() >= 2 {
                break;
            }
            time::sleep(decade).await;
        }
        settle().await;
        assert_eq!(connector.attempt_times().len(), 2);
        assert_eq!(events.try_recv().ok(), Some(status(ConnectionStatus::Disconnected)));

        assert_eq!(client.subscriptions().await.unwrap(), vec![LotId::Int(1)]);
        assert_eq!(client.state(), ConnectionState::Closed);
        client.stop().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_after_failure_resets_attempts() {
        let connector = MockConnector::new();
        for _ in 0..3 {
            connector.push_refusal();
        }
        let _server = connector.push_session();
        let config = RealtimeConfig { max_reconnect_attempts: 2, ..config() };
        let (client, mut events) = client_with(config, &connector);

        client.start().unwrap();
        for _ in 0..3 {
            assert_eq!(next_event(&mut events).await, status(ConnectionStatus::Disconnected));
        }
        assert_eq!(next_event(&mut events).await, status(ConnectionStatus::Failed));
        assert_eq!(connector.attempt_times().len(), 3);

        client.start().unwrap();
        assert_eq!(next_event(&mut events).await, status(ConnectionStatus::Connected));
        assert_eq!(connector.attempt_times().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_closes_and_never_reconnects() {
        let connector = MockConnector::new();
        let _server = connector.push_session();
        let (client, mut events) = client_with(config(), &connector);

        client.start().unwrap();
        assert_eq!(next_event(&mut events).await, status(ConnectionStatus::Connected));

        client.stop().unwrap();
        assert_eq!(next_event(&mut events).await, status(ConnectionStatus::Disconnected));
        assert_eq!(client.state(), ConnectionState::Closed);

        client.stop().unwrap();
        time::sleep(Duration::from_secs(600)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(connector.attempt_times().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_backoff_cancels_reconnect() {
        let connector = MockConnector::new();
        let server = connector.push_session();
        let (client, mut events) = client_with(config(), &connector);

        client.start().unwrap();
        assert_eq!(next_event(&mut events).await, status(ConnectionStatus::Connected));
        drop(server);
        assert_eq!(next_event(&mut events).await, status(ConnectionStatus::Disconnected));

        client.stop().unwrap();
        time::sleep(Duration::from_secs(600)).await;
        assert_eq!(connector.attempt_times().len(), 1);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_every_interval_while_open() {
        let connector = MockConnector::new();
        let mut server = connector.push_session();
        let (client, mut events) = client_with(config(), &connector);

        client.start().unwrap();
        assert_eq!(next_event(&mut events).await, status(ConnectionStatus::Connected));

        time::sleep(Duration::from_secs(29)).await;
        assert!(server.drain_sent().is_empty());

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(server.drain_sent(), vec![ClientMessage::Heartbeat]);

        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(server.drain_sent(), vec![ClientMessage::Heartbeat]);

        client.stop().unwrap();
        assert_eq!(next_event(&mut events).await, status(ConnectionStatus::Disconnected));
        time::sleep(Duration::from_secs(120)).await;
        assert!(server.drain_control().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_not_open_is_dropped() {
        let connector = MockConnector::new();
        let mut server = connector.push_session();
        let (client, mut events) = client_with(config(), &connector);

        client.send(ClientMessage::Heartbeat).unwrap();
        client.start().unwrap();
        assert_eq!(next_event(&mut events).await, status(ConnectionStatus::Connected));
        settle().await;
        assert!(server.drain_sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lot_channel_sends_no_control_frames() {
        let connector = MockConnector::new();
        let mut server = connector.push_session();
        let config = RealtimeConfig { channel: Channel::Lot(LotId::Int(3)), ..config() };
        let (client, mut events) = client_with(config, &connector);

        client.subscribe(LotId::Int(8)).unwrap();
        client.start().unwrap();
        assert_eq!(next_event(&mut events).await, status(ConnectionStatus::Connected));
        assert_eq!(
            connector.attempted_urls()[0].as_str(),
            "wss://parking.example.com/ws/parking/3/"
        );

        server.push(
            r#"{"type":"initial_data","parking_lot":{"name":"Main"},"spots":[{"id":1,"is_occupied":false}]}"#,
        );
        server.push(r#"{"type":"spot_update","spots":[{"id":1,"is_occupied":true}]}"#);

        let initial = next_event(&mut events).await;
        assert!(matches!(initial, RealtimeEvent::ParkingUpdate { ref id, .. } if *id == LotId::Int(3)));
        match next_event(&mut events).await {
            RealtimeEvent::ParkingUpdate { data, .. } => {
                assert_eq!(data.spots()[0]["is_occupied"], json!(true));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        settle().await;
        assert!(server.drain_control().is_empty());
        assert_eq!(
            client.subscriptions().await.unwrap(),
            vec![LotId::Int(3), LotId::Int(8)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_client_closes_connection() {
        let connector = MockConnector::new();
        let mut server = connector.push_session();
        let (client, mut events) = client_with(config(), &connector);

        client.start().unwrap();
        assert_eq!(next_event(&mut events).await, status(ConnectionStatus::Connected));
        drop(client);

        assert_eq!(next_event(&mut events).await, status(ConnectionStatus::Disconnected));
        settle().await;
        assert!(server.drain_sent().is_empty());
    }
}
