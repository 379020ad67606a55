//! # Local Parking Backend Fixtures
//!
//! Throwaway `axum` servers the integration tests run against: a WebSocket
//! endpoint that hands every accepted connection to the test, and a small
//! REST API for lots and bookings.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// Installs `env_logger` once; later calls are ignored.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Binds `127.0.0.1:0` and serves `app` in the background.
async fn serve(app: Router) -> anyhow::Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            log::error!("Fixture server on {} stopped: {}", addr, e);
        }
    });
    Ok(addr)
}

/// A port nothing is listening on.
pub async fn unused_port() -> anyhow::Result<u16> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?.port())
}

/// One accepted WebSocket connection, seen from the server.
///
/// Dropping it closes the socket from the server side.
pub struct ServerConnection {
    /// Request path, e.g. `/ws/parking/` or `/ws/parking/3/`.
    pub path: String,
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl ServerConnection {
    /// Sends a text frame to the client.
    pub fn send(&self, text: impl Into<String>) {
        let _ = self.to_client.send(text.into());
    }

    /// Next frame the client sent, decoded as JSON. `None` once the client
    /// has closed the socket.
    pub async fn recv(&mut self) -> Option<Value> {
        let text = tokio::time::timeout(Duration::from_secs(10), self.from_client.recv())
            .await
            .ok()??;
        serde_json::from_str(&text).ok()
    }

    /// Like `recv`, skipping heartbeats.
    pub async fn recv_control(&mut self) -> Option<Value> {
        loop {
            let frame = self.recv().await?;
            if frame["type"] != "heartbeat" {
                return Some(frame);
            }
        }
    }

    /// Waits until the client closes the socket.
    pub async fn closed(&mut self) -> bool {
        let drained = async { while self.from_client.recv().await.is_some() {} };
        tokio::time::timeout(Duration::from_secs(10), drained).await.is_ok()
    }
}

/// A WebSocket server mounted at `/ws/parking/` and `/ws/parking/{id}/`.
pub struct WsServer {
    /// Address the server listens on.
    pub addr: SocketAddr,
    connections: mpsc::UnboundedReceiver<ServerConnection>,
}

impl WsServer {
    /// Starts the server.
    pub async fn start() -> anyhow::Result<Self> {
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let app = Router::new()
            .route("/ws/parking/", get(ws_handler))
            .route("/ws/parking/{id}/", get(ws_handler))
            .with_state(conn_tx);
        let addr = serve(app).await?;
        Ok(Self { addr, connections: conn_rx })
    }

    /// The page origin a client would be loaded from.
    pub fn origin(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Waits for the next client connection.
    pub async fn accept(&mut self) -> Option<ServerConnection> {
        tokio::time::timeout(Duration::from_secs(10), self.connections.recv())
            .await
            .ok()?
    }

    /// A connection that has already been accepted, without waiting.
    pub fn accept_now(&mut self) -> Option<ServerConnection> {
        self.connections.try_recv().ok()
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    uri: axum::http::Uri,
    State(conn_tx): State<mpsc::UnboundedSender<ServerConnection>>,
) -> impl IntoResponse {
    let path = uri.path().to_string();
    ws.on_upgrade(move |socket| handle_socket(socket, path, conn_tx))
}

async fn handle_socket(socket: WebSocket, path: String, conn_tx: mpsc::UnboundedSender<ServerConnection>) {
    let (to_client_tx, mut to_client_rx) = mpsc::unbounded_channel::<String>();
    let (from_client_tx, from_client_rx) = mpsc::unbounded_channel::<String>();
    let connection = ServerConnection { path: path.clone(), to_client: to_client_tx, from_client: from_client_rx };
    if conn_tx.send(connection).is_err() {
        return;
    }
    log::debug!("Fixture accepted {}", path);

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let _ = from_client_tx.send(text.as_str().to_string());
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            outgoing = to_client_rx.recv() => match outgoing {
                Some(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                // The test dropped its end: hang up.
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }
    log::debug!("Fixture connection {} finished", path);
}

/// Requests seen by the REST fixture.
#[derive(Debug, Default, Clone)]
pub struct ApiLog {
    /// Booking bodies posted to `/api/bookings/`.
    pub bookings: Vec<Value>,
    /// `Authorization` header of each booking request.
    pub authorization: Vec<Option<String>>,
}

/// The lot and booking REST endpoints.
pub struct ApiServer {
    /// Address the server listens on.
    pub addr: SocketAddr,
    log: Arc<Mutex<ApiLog>>,
}

impl ApiServer {
    /// Starts the server. Lot `3` exists; every other id is a 404.
    pub async fn start() -> anyhow::Result<Self> {
        let log = Arc::new(Mutex::new(ApiLog::default()));
        let app = Router::new()
            .route("/api/parking-lots/{id}/", get(get_lot))
            .route("/api/bookings/", post(create_booking))
            .with_state(Arc::clone(&log));
        let addr = serve(app).await?;
        Ok(Self { addr, log })
    }

    /// Base URL for `ParkingApi`.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Requests recorded so far.
    pub fn requests(&self) -> ApiLog {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }
}

async fn get_lot(Path(id): Path<i64>) -> impl IntoResponse {
    if id == 3 {
        (
            StatusCode::OK,
            Json(json!({"id": 3, "name": "Main", "available_spaces": 12, "hourly_rate": "2.50", "address": "1 High St"})),
        )
    } else {
        (StatusCode::NOT_FOUND, Json(json!({"detail": "Not found."})))
    }
}

async fn create_booking(
    State(log): State<Arc<Mutex<ApiLog>>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let auth = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if let Ok(mut log) = log.lock() {
        log.bookings.push(body.clone());
        log.authorization.push(auth);
    }
    if body.get("parking_spot").and_then(Value::as_i64).is_none() {
        return (StatusCode::BAD_REQUEST, Json(json!({"parking_spot": ["This field is required."]})));
    }
    (
        StatusCode::CREATED,
        Json(json!({"id": 501, "status": "pending", "parking_spot": body["parking_spot"]})),
    )
}
