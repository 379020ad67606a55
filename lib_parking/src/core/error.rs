use thiserror::Error;

/// Errors surfaced by the realtime client.
///
/// Transport failures never reach callers of `RealtimeClient`; the manager
/// task turns them into `connection_status` events. They appear here only as
/// the return type of `Connector` and `TransportSession`.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// The configured page origin is not a valid URL.
    #[error("invalid origin: {0}")]
    InvalidOrigin(#[from] url::ParseError),

    /// The origin scheme has no WebSocket counterpart.
    #[error("unsupported origin scheme '{0}' (expected http, https, ws or wss)")]
    UnsupportedScheme(String),

    /// The origin has no host component.
    #[error("origin '{0}' has no host")]
    MissingHost(String),

    /// Connecting, sending or receiving on the transport failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The connection manager task is no longer running.
    #[error("connection task is not running")]
    ClientGone,
}
