use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use url::Url;

use crate::core::connection::{Command, ConnectionManager, ConnectionState};
use crate::core::dispatcher::{Dispatcher, Listener, ListenerId};
use crate::core::envelope::{ClientMessage, LotId};
use crate::core::error::RealtimeError;
use crate::core::events::{EventKind, LotSnapshot, RealtimeEvent};
use crate::core::transport::{endpoint_for, Channel, Connector, TungsteniteConnector};

/// Connection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeConfig {
    /// Page origin the endpoint is derived from, e.g. `https://parking.example.com`.
    pub origin: String,
    /// Multiplexed or per-lot channel.
    pub channel: Channel,
    /// Time between heartbeats while open. Zero disables heartbeats.
    pub heartbeat_interval: Duration,
    /// Reconnect attempt `N` waits `N` times this.
    pub reconnect_base_delay: Duration,
    /// Attempts before `failed` is emitted.
    pub max_reconnect_attempts: u32,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            origin: "http://localhost:8000".to_string(),
            channel: Channel::Multiplexed,
            heartbeat_interval: Duration::from_secs(30),
            reconnect_base_delay: Duration::from_secs(5),
            max_reconnect_attempts: 5,
        }
    }
}

impl RealtimeConfig {
    /// The WebSocket endpoint these settings connect to.
    pub fn endpoint(&self) -> Result<Url, RealtimeError> {
        endpoint_for(&self.origin, &self.channel)
    }
}

/// Handle to a running connection manager.
///
/// Creating a client spawns the manager task, which is why `new` must be
/// called inside a tokio runtime. Nothing connects until [`start`] is called.
/// Dropping the handle closes the connection and ends the task.
///
/// [`start`]: RealtimeClient::start
pub struct RealtimeClient {
    commands: mpsc::UnboundedSender<Command>,
    dispatcher: Arc<Dispatcher>,
    state: watch::Receiver<ConnectionState>,
    endpoint: Url,
    _task: JoinHandle<()>,
}

impl RealtimeClient {
    /// Creates a client using the WebSocket transport.
    pub fn new(config: RealtimeConfig) -> Result<Self, RealtimeError> {
        Self::with_connector(config, TungsteniteConnector)
    }

    /// Creates a client on top of a custom transport.
    pub fn with_connector<C: Connector>(config: RealtimeConfig, connector: C) -> Result<Self, RealtimeError> {
        let endpoint = config.endpoint()?;
        let dispatcher = Arc::new(Dispatcher::new());
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        let manager = ConnectionManager::new(connector, endpoint.clone(), &config, Arc::clone(&dispatcher), state_tx);
        let task = tokio::spawn(manager.run(command_rx));
        log::debug!("Realtime client created for {}", endpoint);

        Ok(Self {
            commands: command_tx,
            dispatcher,
            state: state_rx,
            endpoint,
            _task: task,
        })
    }

    fn command(&self, command: Command) -> Result<(), RealtimeError> {
        self.commands.send(command).map_err(|_| RealtimeError::ClientGone)
    }

    /// Opens the connection. Also resets the reconnect counter, so it is the
    /// way out of the `failed` state.
    pub fn start(&self) -> Result<(), RealtimeError> {
        self.command(Command::Start)
    }

    /// Closes the connection and cancels any pending reconnect. Calling it
    /// again is a no-op.
    pub fn stop(&self) -> Result<(), RealtimeError> {
        self.command(Command::Stop)
    }

    /// Sends a message if the connection is open; otherwise it is dropped.
    pub fn send(&self, message: ClientMessage) -> Result<(), RealtimeError> {
        self.command(Command::Send(message))
    }

    /// Adds a lot to the subscription intent.
    pub fn subscribe(&self, id: impl Into<LotId>) -> Result<(), RealtimeError> {
        self.command(Command::Subscribe(id.into()))
    }

    /// Removes a lot from the subscription intent.
    pub fn unsubscribe(&self, id: impl Into<LotId>) -> Result<(), RealtimeError> {
        self.command(Command::Unsubscribe(id.into()))
    }

    /// Registers a closure for `kind`.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> ListenerId
    where
        F: Fn(&RealtimeEvent) + Send + Sync + 'static,
    {
        self.dispatcher.on_fn(kind, callback)
    }

    /// Registers a shared callback for `kind`. Registering the same `Arc`
    /// twice for one kind returns the existing token.
    pub fn on_listener(&self, kind: EventKind, callback: Listener) -> ListenerId {
        self.dispatcher.on(kind, callback)
    }

    /// Removes a registration. Unknown tokens are ignored.
    pub fn off(&self, id: ListenerId) -> bool {
        self.dispatcher.off(id)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver that observes every lifecycle transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// The WebSocket endpoint this client connects to.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Cached attributes for a lot, `None` when no update has been seen.
    pub async fn lot(&self, id: impl Into<LotId>) -> Result<Option<LotSnapshot>, RealtimeError> {
        let (reply, response) = oneshot::channel();
        self.command(Command::Lot { id: id.into(), reply })?;
        response.await.map_err(|_| RealtimeError::ClientGone)
    }

    /// The subscription intent, in id order.
    pub async fn subscriptions(&self) -> Result<Vec<LotId>, RealtimeError> {
        let (reply, response) = oneshot::channel();
        self.command(Command::Subscriptions { reply })?;
        response.await.map_err(|_| RealtimeError::ClientGone)
    }
}
