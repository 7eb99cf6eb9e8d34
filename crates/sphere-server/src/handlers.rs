//! Connection handlers for the Sphere server.
//!
//! This module wires the shared services, serves HTTP and drives each
//! gateway connection.

use crate::api;
use crate::config::Config;
use crate::error::{ApiError, ApiResult};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use sphere_core::{
    AccountService, DeliveryRouter, Engagement, Error, Gateway, GatewayAuth, Handshake,
    LogNotifier, MemoryDirectory, MemoryMessageLog, MemoryNotificationLog, MessageStore,
    NotificationCenter, PresenceRegistry, Session, TokenService, UserDirectory,
};
use sphere_protocol::{codec, ClientEvent, ProtocolError, ServerEvent, WireFormat};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Counts open gateway sockets against `limits.max_connections`.
///
/// Superseded sockets leave presence but stay open, so this is tracked apart
/// from the registry.
pub struct ConnectionSlots {
    open: AtomicUsize,
    limit: usize,
}

impl ConnectionSlots {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            open: AtomicUsize::new(0),
            limit,
        }
    }

    /// Claim a slot, or `None` if every slot is taken.
    pub fn try_acquire(self: &Arc<Self>) -> Option<SlotGuard> {
        self.open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                (open < self.limit).then_some(open + 1)
            })
            .ok()?;
        Some(SlotGuard {
            slots: Arc::clone(self),
        })
    }

    /// Number of open sockets.
    #[must_use]
    pub fn open(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }
}

/// An open socket's claim on a slot, released on drop.
pub struct SlotGuard {
    slots: Arc<ConnectionSlots>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.slots.open.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Shared server state.
pub struct AppState {
    pub config: Config,
    pub connections: Arc<ConnectionSlots>,
    pub directory: Arc<dyn UserDirectory>,
    pub tokens: Arc<TokenService>,
    pub accounts: AccountService,
    pub gateway: Arc<Gateway>,
    pub messages: Arc<MessageStore>,
    pub notifications: Arc<NotificationCenter>,
    pub engagement: Engagement,
}

impl AppState {
    /// Build every service over in-process storage.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let directory: Arc<dyn UserDirectory> = Arc::new(MemoryDirectory::new());
        let tokens = Arc::new(TokenService::new(directory.clone(), &config.token_config()));
        let accounts = AccountService::new(
            directory.clone(),
            tokens.clone(),
            Arc::new(LogNotifier::new()),
            config.account_settings(),
        );

        let presence = Arc::new(PresenceRegistry::new());
        let notifications = Arc::new(NotificationCenter::new(
            Arc::new(MemoryNotificationLog::new()),
            directory.clone(),
        ));
        let router = Arc::new(DeliveryRouter::new(presence.clone(), notifications.clone()));
        let messages = Arc::new(MessageStore::new(
            Arc::new(MemoryMessageLog::new()),
            directory.clone(),
        ));
        let gateway = Arc::new(Gateway::new(
            GatewayAuth::new(tokens.clone()),
            presence,
            messages.clone(),
            router.clone(),
        ));
        let engagement = Engagement::new(directory.clone(), router);
        let connections = Arc::new(ConnectionSlots::new(config.limits.max_connections));

        Self {
            config,
            connections,
            directory,
            tokens,
            accounts,
            gateway,
            messages,
            notifications,
            engagement,
        }
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .merge(api::routes())
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let ws_path = config.transport.websocket_path.clone();
    let state = Arc::new(AppState::new(config));

    let listener = TcpListener::bind(addr).await?;

    info!("Sphere server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, ws_path);

    axum::serve(listener, app(state)).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "online": state.gateway.presence().count(),
    }))
}

#[derive(Debug, Deserialize)]
struct WsParams {
    token: Option<String>,
    /// `json` (default) or `msgpack`.
    format: Option<String>,
}

/// Token from an `Authorization: Bearer` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// WebSocket upgrade handler.
///
/// The token is verified before upgrading, so a rejected client never gets a
/// socket.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
) -> Response {
    let token = params.token.as_deref().or_else(|| bearer_token(&headers));
    let mut handshake = state.gateway.handshake();
    if let Err(e) = handshake.authenticate(token) {
        metrics::record_auth_failure("gateway");
        return ApiError::from(e).into_response();
    }

    let Some(slot) = state.connections.try_acquire() else {
        warn!(open = state.connections.open(), "Connection limit reached");
        return ApiError::Unavailable.into_response();
    };

    let format = params
        .format
        .as_deref()
        .and_then(WireFormat::from_name)
        .unwrap_or_default();

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, handshake, format, slot))
}

/// Handle an authenticated WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    handshake: Handshake,
    format: WireFormat,
    _slot: SlotGuard,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    // Registers presence and queues `online_users` before the first select.
    let (mut session, mut outbox) = match handshake.open() {
        Ok(opened) => opened,
        Err(e) => {
            error!(error = %e, "Upgraded an unauthenticated handshake");
            return;
        }
    };
    let connection_id = session.connection_id().clone();
    metrics::set_online_users(state.gateway.presence().count());

    debug!(connection = %connection_id, ?format, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    // Read buffer for partial MessagePack frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            biased;

            // Events routed to this connection
            Some(event) = outbox.recv() => {
                if send_event(&mut sender, &event, format).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match codec::from_json::<ClientEvent>(&text) {
                            Ok(event) => {
                                if dispatch(&mut session, &mut sender, event, text.len(), format).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(connection = %connection_id, error = %e, "Malformed text frame");
                                metrics::record_error("decode");
                                let reply = malformed_event(&e);
                                if send_event(&mut sender, &reply, format).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        read_buffer.extend_from_slice(&data);

                        let mut closed = false;
                        for decoded in drain_binary(&mut read_buffer) {
                            let sent = match decoded {
                                Ok(event) => dispatch(&mut session, &mut sender, event, data.len(), format).await.is_ok(),
                                Err(e) => {
                                    debug!(connection = %connection_id, error = %e, "Malformed binary frame");
                                    metrics::record_error("decode");
                                    send_event(&mut sender, &malformed_event(&e), format).await.is_ok()
                                }
                            };
                            if !sent {
                                closed = true;
                                break;
                            }
                        }
                        if closed {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    session.close();
    metrics::set_online_users(state.gateway.presence().count());

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Hand one inbound event to the session, replying with an `error` event if
/// it fails. Only a dead socket is returned as an error.
async fn dispatch(
    session: &mut Session,
    sender: &mut SplitSink<WebSocket, Message>,
    event: ClientEvent,
    bytes: usize,
    format: WireFormat,
) -> Result<()> {
    let start = Instant::now();
    let name = event.name();
    metrics::record_event(name, "inbound", bytes);

    match session.handle(event.into()).await {
        Ok(Some(delivery)) => metrics::record_delivery(delivery.as_str()),
        Ok(None) => {}
        Err(e) => {
            debug!(connection = %session.connection_id(), event = name, error = %e, "Event rejected");
            send_event(sender, &error_event(e), format).await?;
        }
    }

    metrics::record_latency(start.elapsed().as_secs_f64());
    Ok(())
}

/// Decode every complete event buffered so far, in order.
///
/// An undecodable event is consumed and reported while later events in the
/// buffer still decode. An oversized length prefix cannot be skipped, so the
/// buffer is dropped.
fn drain_binary(buf: &mut BytesMut) -> Vec<std::result::Result<ClientEvent, ProtocolError>> {
    let mut decoded = Vec::new();
    loop {
        match codec::decode_from::<ClientEvent>(buf) {
            Ok(Some(event)) => decoded.push(Ok(event)),
            Ok(None) => break,
            Err(e @ ProtocolError::FrameTooLarge(_)) => {
                buf.clear();
                decoded.push(Err(e));
                break;
            }
            Err(e) => decoded.push(Err(e)),
        }
    }
    decoded
}

fn malformed_event(err: &ProtocolError) -> ServerEvent {
    let err = ApiError::BadRequest(format!("malformed event: {err}"));
    ServerEvent::error(err.status().as_u16(), err.public_message())
}

fn error_event(err: Error) -> ServerEvent {
    let err = ApiError::from(err);
    ServerEvent::error(err.status().as_u16(), err.public_message())
}

/// Send an event to the WebSocket.
async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
    format: WireFormat,
) -> ApiResult<()> {
    let message = match format {
        WireFormat::Json => codec::to_json(event).map(Message::Text),
        WireFormat::MessagePack => codec::encode(event).map(|data| Message::Binary(data.to_vec())),
    }
    .map_err(|e| ApiError::from(Error::Internal(e.to_string())))?;

    let bytes = match &message {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    };
    metrics::record_event(event.name(), "outbound", bytes);

    sender
        .send(message)
        .await
        .map_err(|e| ApiError::from(Error::Internal(e.to_string())))
}
