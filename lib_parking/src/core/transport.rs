//! # Transport
//!
//! The connection manager talks to the network only through [`Connector`]
//! and [`TransportSession`]. Production uses [`TungsteniteConnector`]; tests
//! substitute an in-memory pair so lifecycle timing can run on a paused
//! clock.
//!
//! This module also derives the WebSocket endpoint from the page origin:
//! `https` maps to `wss` and `http` to `ws`, never the other way round.

use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::core::envelope::LotId;
use crate::core::error::RealtimeError;

/// Which server channel the client attaches to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Channel {
    /// `/ws/parking/`, topics chosen with `subscribe`/`unsubscribe`.
    #[default]
    Multiplexed,
    /// `/ws/parking/<id>/`, a channel bound to one lot.
    Lot(LotId),
}

impl Channel {
    /// Path component of the endpoint.
    pub fn path(&self) -> String {
        match self {
            Channel::Multiplexed => "/ws/parking/".to_string(),
            Channel::Lot(id) => format!("/ws/parking/{}/", id),
        }
    }

    /// The lot a per-lot channel is bound to.
    pub fn focus(&self) -> Option<&LotId> {
        match self {
            Channel::Multiplexed => None,
            Channel::Lot(id) => Some(id),
        }
    }

    /// Whether subscribe/unsubscribe control frames are sent on this channel.
    /// On a per-lot channel the URL itself is the subscription.
    pub fn sends_control_frames(&self) -> bool {
        matches!(self, Channel::Multiplexed)
    }
}

/// Builds the WebSocket endpoint for `channel` from a page origin such as
/// `https://parking.example.com:8443`.
pub fn endpoint_for(origin: &str, channel: &Channel) -> Result<Url, RealtimeError> {
    let origin_url = Url::parse(origin)?;
    let scheme = match origin_url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => return Err(RealtimeError::UnsupportedScheme(other.to_string())),
    };
    let host = origin_url
        .host_str()
        .ok_or_else(|| RealtimeError::MissingHost(origin.to_string()))?;
    let authority = match origin_url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    Ok(Url::parse(&format!("{}://{}{}", scheme, authority, channel.path()))?)
}

/// A frame delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
}

/// One open transport connection.
pub trait TransportSession: Send + 'static {
    /// Sends one text frame.
    fn send_text(&mut self, text: String) -> impl Future<Output = Result<(), RealtimeError>> + Send;

    /// Waits for the next data frame. `None` means the connection closed.
    /// Must be cancel-safe; the manager polls it inside `select!`.
    fn next_frame(&mut self) -> impl Future<Output = Option<Result<Frame, RealtimeError>>> + Send;

    /// Closes the connection. Closing twice is harmless.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Opens transport connections.
pub trait Connector: Clone + Send + Sync + 'static {
    /// The session type produced by a successful connect.
    type Session: TransportSession;

    /// Opens a connection to `endpoint`.
    fn connect(&self, endpoint: &Url) -> impl Future<Output = Result<Self::Session, RealtimeError>> + Send;
}

/// WebSocket transport backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

/// An open `tokio-tungstenite` connection.
pub struct TungsteniteSession {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Connector for TungsteniteConnector {
    type Session = TungsteniteSession;

    async fn connect(&self, endpoint: &Url) -> Result<TungsteniteSession, RealtimeError> {
        let (stream, response) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| RealtimeError::Transport(e.to_string()))?;
        log::debug!("WebSocket handshake with {} completed ({})", endpoint, response.status());
        Ok(TungsteniteSession { stream })
    }
}

impl TransportSession for TungsteniteSession {
    async fn send_text(&mut self, text: String) -> Result<(), RealtimeError> {
        // .into() converts String to Utf8Bytes for newer tungstenite versions
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| RealtimeError::Transport(e.to_string()))
    }

    async fn next_frame(&mut self) -> Option<Result<Frame, RealtimeError>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(Frame::Text(text.to_string()))),
                Some(Ok(Message::Binary(bytes))) => return Some(Ok(Frame::Binary(bytes.to_vec()))),
                Some(Ok(Message::Close(frame))) => {
                    log::debug!("Close frame received: {:?}", frame);
                    return None;
                }
                // Ping/Pong are answered by tungstenite itself.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Some(Err(RealtimeError::Transport(e.to_string()))),
                None => return None,
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            log::debug!("Ignoring error while closing WebSocket: {}", e);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secure_origin_maps_to_wss() {
        let url = endpoint_for("https://parking.example.com", &Channel::Multiplexed).unwrap();
        assert_eq!(url.as_str(), "wss://parking.example.com/ws/parking/");
    }

    #[test]
    fn test_plain_origin_maps_to_ws_and_keeps_port() {
        let url = endpoint_for("http://127.0.0.1:8000/lots/?page=2#top", &Channel::Multiplexed).unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:8000/ws/parking/");
    }

    #[test]
    fn test_lot_channel_path() {
        let url = endpoint_for("https://parking.example.com", &Channel::Lot(LotId::Int(17))).unwrap();
        assert_eq!(url.as_str(), "wss://parking.example.com/ws/parking/17/");
        assert_eq!(Channel::Lot(LotId::Int(17)).focus(), Some(&LotId::Int(17)));
        assert!(!Channel::Lot(LotId::Int(17)).sends_control_frames());
        assert!(Channel::Multiplexed.sends_control_frames());
    }

    #[test]
    fn test_websocket_origins_are_accepted_as_is() {
        let url = endpoint_for("wss://edge.example.com:9443", &Channel::Multiplexed).unwrap();
        assert_eq!(url.as_str(), "wss://edge.example.com:9443/ws/parking/");
    }

    #[test]
    fn test_bad_origins_are_rejected() {
        assert!(matches!(
            endpoint_for("ftp://files.example.com", &Channel::Multiplexed),
            Err(RealtimeError::UnsupportedScheme(s)) if s == "ftp"
        ));
        assert!(matches!(
            endpoint_for("not a url", &Channel::Multiplexed),
            Err(RealtimeError::InvalidOrigin(_))
        ));
    }
}
