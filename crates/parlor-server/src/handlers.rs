//! Connection handlers for Parlor server.
//!
//! Each WebSocket gets two tasks. The reader decodes frames and feeds them to
//! the connection's [`Session`] one at a time; the writer drains the bounded
//! outbound queue into the socket. Replies to the client (acks, errors,
//! history) go through the same queue, so they stay ordered with fan-out.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::storage;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, StreamExt};
use parlor_core::{
    ChatMessage, ClientEvent, ConnectionId, Hub, Identity, MessageStore, Outbound, Reply, Session,
    Submission,
};
use parlor_protocol::{codec, codes, Encoded, Frame, ProtocolError, WireFormat};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The relay hub.
    pub hub: Arc<Hub>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state over a message store.
    #[must_use]
    pub fn new(config: Config, store: Arc<dyn MessageStore>) -> Self {
        Self {
            hub: Arc::new(Hub::with_config(config.hub_config(), store)),
            config,
        }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the store cannot be opened or the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let store = storage::open_store(&config.storage).await?;
    let state = Arc::new(AppState::new(config.clone(), store));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Parlor server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    serve(listener, state).await
}

/// Serve the app on an already bound listener.
///
/// # Errors
///
/// Returns an error if the server stops with an I/O error.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    axum::serve(listener, build_app(state)).await?;
    Ok(())
}

/// Build the HTTP router.
pub fn build_app(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/messages", get(messages_handler))
        .with_state(state)
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.hub.stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": stats.connections,
        "rooms": stats.rooms,
    }))
}

/// Stored messages, oldest first.
async fn messages_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.hub.history().await {
        Ok(records) => {
            let messages: Vec<ChatMessage> = records.into_iter().map(ChatMessage::from).collect();
            Json(messages).into_response()
        }
        Err(e) => {
            warn!(error = %e, "Listing messages failed");
            metrics::record_error("persistence");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// Encodings a client can ask for at upgrade time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum FormatParam {
    Json,
    Msgpack,
}

impl From<FormatParam> for WireFormat {
    fn from(param: FormatParam) -> Self {
        match param {
            FormatParam::Json => WireFormat::Json,
            FormatParam::Msgpack => WireFormat::MessagePack,
        }
    }
}

/// Query string of the WebSocket upgrade, e.g. `/ws?format=json`.
#[derive(Debug, Default, Deserialize)]
struct WsParams {
    /// Encoding used until the client's first frame says otherwise.
    #[serde(default)]
    format: Option<FormatParam>,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let initial = params.format.map(WireFormat::from).unwrap_or_default();
    ws.on_upgrade(move |socket| handle_websocket(socket, state, initial))
}

/// Frames the client may not send, or could not be read.
#[derive(Debug, Error)]
enum InboundError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Unexpected {0} frame from client")]
    Unexpected(&'static str),
}

/// A decoded client frame.
enum Inbound {
    /// Applied to the session; `request` is echoed in the reply.
    Event {
        request: Option<u64>,
        event: ClientEvent,
    },
    /// Answered directly.
    Ping(Option<u64>),
    /// Ignored.
    Pong,
}

impl TryFrom<Frame> for Inbound {
    type Error = InboundError;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        let (request, event) = match frame {
            Frame::Announce {
                user_id,
                display_name,
            } => (None, ClientEvent::Announce(Identity::new(user_id, display_name))),
            Frame::Join { id, room } => (id, ClientEvent::Join { room }),
            Frame::JoinDirect { id, user_id } => (id, ClientEvent::JoinDirect { user_id }),
            Frame::Leave { id, room } => (id, ClientEvent::Leave { room }),
            Frame::Send {
                id,
                room,
                content,
                user_id,
                display_name,
                timestamp,
            } => {
                let submission = Submission {
                    room_id: room,
                    content,
                    claimed_user_id: user_id,
                    claimed_display_name: display_name,
                    client_timestamp: timestamp,
                };
                (id, ClientEvent::Submit(submission))
            }
            Frame::History { id } => (id, ClientEvent::History),
            Frame::Ping { timestamp } => return Ok(Inbound::Ping(timestamp)),
            Frame::Pong { .. } => return Ok(Inbound::Pong),
            other => return Err(InboundError::Unexpected(other.frame_type().as_str())),
        };
        Ok(Inbound::Event { request, event })
    }
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, initial: WireFormat) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (mut session, outbound) = match Session::open(Arc::clone(&state.hub)) {
        Ok(opened) => opened,
        Err(e) => {
            warn!(error = %e, "Refusing connection");
            metrics::record_error("admission");
            refuse(socket, &Frame::error(None, codes::CLOSED, e.to_string()), initial).await;
            return;
        }
    };
    let connection_id = session.id().clone();
    debug!(connection = %connection_id, "WebSocket connected");

    let (sink, stream) = socket.split();
    let (format_tx, format_rx) = watch::channel(initial);

    let connected = Frame::connected(
        connection_id.as_str(),
        state.config.heartbeat.interval_ms,
    );
    tokio::spawn(write_loop(
        sink,
        outbound,
        format_rx,
        connected,
        connection_id.clone(),
    ));

    read_loop(stream, &mut session, &state, &format_tx).await;

    // Evicting closes the outbound queue, which ends the writer.
    session.close();
    metrics::set_active_rooms(state.hub.stats().rooms);

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Send one frame to a connection that was not admitted, then close it.
async fn refuse(mut socket: WebSocket, frame: &Frame, format: WireFormat) {
    let _ = send_frame(&mut socket, frame, format).await;
    let _ = socket.close().await;
}

/// Read frames until the client goes away.
async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    session: &mut Session,
    state: &AppState,
    format: &watch::Sender<WireFormat>,
) {
    // Read buffer for partial frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Binary(data)) => {
                metrics::record_frame(data.len(), "inbound");
                format.send_replace(WireFormat::MessagePack);
                read_buffer.extend_from_slice(&data);

                loop {
                    match codec::decode_from(&mut read_buffer) {
                        Ok(Some(frame)) => handle_frame(session, state, frame).await,
                        Ok(None) => break,
                        Err(e @ ProtocolError::FrameTooLarge(_)) => {
                            // The length prefix cannot be trusted; drop what we have.
                            read_buffer.clear();
                            reject(session, state, e.into());
                            break;
                        }
                        Err(e) => reject(session, state, e.into()),
                    }
                }
            }
            Ok(Message::Text(text)) => {
                metrics::record_frame(text.len(), "inbound");
                format.send_replace(WireFormat::Json);

                match codec::decode_json(&text) {
                    Ok(frame) => handle_frame(session, state, frame).await,
                    Err(e) => reject(session, state, e.into()),
                }
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                // Transport keepalives are answered by the WebSocket layer.
            }
            Ok(Message::Close(_)) => {
                debug!(connection = %session.id(), "Received close frame");
                break;
            }
            Err(e) => {
                warn!(connection = %session.id(), error = %e, "WebSocket error");
                metrics::record_error("websocket");
                break;
            }
        }
    }
}

/// Drain the outbound queue into the socket, in the client's current format.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: Outbound,
    format: watch::Receiver<WireFormat>,
    connected: Frame,
    connection_id: ConnectionId,
) {
    let wire = *format.borrow();
    if let Err(e) = send_frame(&mut sink, &connected, wire).await {
        debug!(connection = %connection_id, error = %e, "Failed to send Connected frame");
        return;
    }

    while let Some(frame) = outbound.recv().await {
        let wire = *format.borrow();
        if let Err(e) = send_frame(&mut sink, &frame, wire).await {
            debug!(connection = %connection_id, error = %e, "Writer stopped");
            break;
        }
    }

    let _ = sink.close().await;
}

/// Apply one decoded frame and queue the reply, if any.
async fn handle_frame(session: &mut Session, state: &AppState, frame: Frame) {
    let inbound = match Inbound::try_from(frame) {
        Ok(inbound) => inbound,
        Err(e) => {
            reject(session, state, e);
            return;
        }
    };

    let reply = match inbound {
        Inbound::Event { request, event } => {
            let start = Instant::now();
            match session.handle(event).await {
                Ok(reply) => reply_frame(request, reply, start, state),
                Err(e) => {
                    warn!(connection = %session.id(), code = e.code(), error = %e, "Request failed");
                    metrics::record_error("request");
                    Some(Frame::error(request, e.code(), e.to_string()))
                }
            }
        }
        Inbound::Ping(timestamp) => Some(Frame::pong(timestamp)),
        Inbound::Pong => None,
    };

    if let Some(frame) = reply {
        respond(session, state, frame);
    }
}

/// The frame that answers a handled event.
fn reply_frame(request: Option<u64>, reply: Reply, start: Instant, state: &AppState) -> Option<Frame> {
    match reply {
        Reply::Announced | Reply::Closed => None,
        Reply::Joined { .. } | Reply::Left { .. } => {
            metrics::set_active_rooms(state.hub.stats().rooms);
            request.map(Frame::ack)
        }
        Reply::Submitted(report) => {
            metrics::record_submit(&report, start.elapsed().as_secs_f64());
            request.map(Frame::ack)
        }
        Reply::History(records) => Some(Frame::HistoryResult {
            id: request,
            messages: records.into_iter().map(ChatMessage::from).collect(),
        }),
    }
}

/// Report an unreadable frame. The connection stays open.
fn reject(session: &Session, state: &AppState, e: InboundError) {
    warn!(connection = %session.id(), error = %e, "Malformed frame");
    metrics::record_error("malformed");
    respond(
        session,
        state,
        Frame::error(None, codes::MALFORMED_FRAME, e.to_string()),
    );
}

/// Queue a frame for this connection only.
fn respond(session: &Session, state: &AppState, frame: Frame) {
    if let Err(e) = state.hub.registry().deliver(session.id(), Arc::new(frame)) {
        debug!(connection = %session.id(), error = %e, "Reply dropped");
    }
}

/// Encode and send a frame to the WebSocket.
async fn send_frame<S>(sink: &mut S, frame: &Frame, format: WireFormat) -> Result<()>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    let encoded = format.encode(frame)?;
    metrics::record_frame(encoded.len(), "outbound");
    let message = match encoded {
        Encoded::Binary(data) => Message::Binary(data.to_vec()),
        Encoded::Text(text) => Message::Text(text),
    };
    sink.send(message).await?;
    Ok(())
}
