//! WebSocket gateway: JSON commands in, replies and telemetry out.
//!
//! Runs on the event loop. Connections arrive from the TCP accept loop via
//! [`HandoffListener`] and are served by an axum router.

use axum::{
    Json, Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
    routing::get,
    serve::Listener,
};
use futures::{SinkExt, StreamExt};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clients::ClientSet;
use crate::command::{CommandInterpreter, Outcome};

#[derive(Clone)]
pub struct AppState {
    pub interpreter: Arc<CommandInterpreter>,
    pub clients: Arc<ClientSet>,
    /// Capacity of each client's outbound queue
    pub client_queue: usize,
}

#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(websocket_handler))
        .route("/ws", get(websocket_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "jobs": state.interpreter.registry().len(),
        "clients": state.clients.len(),
    }))
}

pub async fn websocket_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // Replies and broadcasts share one queue; only the writer touches the sink
    let (tx, mut rx) = mpsc::channel::<Message>(state.client_queue);
    let client = state.clients.insert(tx.clone());

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sender.send(msg).await.is_err() || closing {
                break;
            }
        }
        let _ = sender.close().await;
    });

    while let Some(frame) = receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => {
                info!(client = %client, "WebSocket connection closed");
                break;
            }
            Ok(Message::Binary(_)) => {
                debug!("Binary messages not supported");
                continue;
            }
            Ok(_) => continue,
            Err(e) => {
                debug!(client = %client, "WebSocket receive error: {}", e);
                break;
            }
        };

        let interpreter = state.interpreter.clone();
        let outcome =
            match tokio::task::spawn_blocking(move || interpreter.handle_json(text.as_str())).await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Command task failed: {}", e);
                    Outcome::Error("internal error".to_string())
                }
            };

        let json = match serde_json::to_string(&outcome.to_reply()) {
            Ok(j) => j,
            Err(e) => {
                error!("Failed to serialize reply: {}", e);
                continue;
            }
        };
        if tx.send(Message::Text(json.into())).await.is_err() {
            break;
        }
        if outcome.closes_connection() {
            let _ = tx.send(Message::Close(None)).await;
            break;
        }
    }

    state.clients.remove(client);
    drop(tx);
    if let Err(e) = writer.await {
        warn!(client = %client, "Writer task failed: {}", e);
    }
}

/// Sender half used by the TCP accept loop to pass on HTTP connections
pub type Handoff = mpsc::UnboundedSender<std::net::TcpStream>;

/// An axum listener fed by connections the TCP accept loop already accepted.
pub struct HandoffListener {
    incoming: mpsc::UnboundedReceiver<std::net::TcpStream>,
    local_addr: SocketAddr,
}

impl HandoffListener {
    pub fn new(local_addr: SocketAddr) -> (Handoff, Self) {
        let (tx, incoming) = mpsc::unbounded_channel();
        (
            tx,
            Self {
                incoming,
                local_addr,
            },
        )
    }
}

impl Listener for HandoffListener {
    type Io = tokio::net::TcpStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            let Some(stream) = self.incoming.recv().await else {
                // Accept loop is gone; nothing more will arrive
                return std::future::pending().await;
            };

            let peer = match stream.peer_addr() {
                Ok(peer) => peer,
                Err(e) => {
                    debug!("Dropping handed-off connection: {}", e);
                    continue;
                }
            };

            let adopted = stream
                .set_nonblocking(true)
                .and_then(|()| tokio::net::TcpStream::from_std(stream));
            match adopted {
                Ok(io) => return (io, peer),
                Err(e) => warn!(peer = %peer, "Failed to adopt connection: {}", e),
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}
