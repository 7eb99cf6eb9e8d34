//! Per-connection dispatch for the realtime gateway.
//!
//! Each accepted connection starts as a [`Handshake`] and, once
//! authenticated, becomes one [`Session`]. The transport feeds the session
//! [`SessionEvent`]s in arrival order and drains the outbox returned by
//! [`Handshake::open`]. Sessions never call into each other; everything another
//! connection should see goes through the [`DeliveryRouter`].
//!
//! ```text
//! Connecting ──▶ Authenticating ──▶ Online ──▶ Disconnected
//!                      │
//!                      └──────────▶ Rejected
//! ```

use sphere_protocol::{ClientEvent, ServerEvent, UserId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::{Connection, ConnectionId, GatewayAuth};
use crate::error::{Error, Result};
use crate::messages::MessageStore;
use crate::presence::{ConnectionHandle, PresenceRegistry};
use crate::router::{Delivery, DeliveryRouter, Typing};

/// Lifecycle of a realtime connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    /// Registered in presence and handling events.
    Online,
    /// Failed authentication. Terminal.
    Rejected,
    /// Closed after being online. Terminal.
    Disconnected,
}

/// Something that happened on a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Send { receiver_id: UserId, content: String },
    StartTyping { receiver_id: UserId },
    StopTyping { receiver_id: UserId },
    Disconnect,
}

impl From<ClientEvent> for SessionEvent {
    fn from(event: ClientEvent) -> Self {
        match event {
            ClientEvent::SendMessage {
                receiver_id,
                content,
            } => SessionEvent::Send {
                receiver_id,
                content,
            },
            ClientEvent::StartTyping { receiver_id } => SessionEvent::StartTyping { receiver_id },
            ClientEvent::StopTyping { receiver_id } => SessionEvent::StopTyping { receiver_id },
        }
    }
}

/// Shared entry point that turns authenticated connections into sessions.
pub struct Gateway {
    auth: GatewayAuth,
    presence: Arc<PresenceRegistry>,
    messages: Arc<MessageStore>,
    router: Arc<DeliveryRouter>,
}

impl Gateway {
    #[must_use]
    pub fn new(
        auth: GatewayAuth,
        presence: Arc<PresenceRegistry>,
        messages: Arc<MessageStore>,
        router: Arc<DeliveryRouter>,
    ) -> Self {
        Self {
            auth,
            presence,
            messages,
            router,
        }
    }

    /// Start a connection attempt.
    #[must_use]
    pub fn handshake(self: &Arc<Self>) -> Handshake {
        Handshake {
            gateway: Arc::clone(self),
            state: ConnectionState::Connecting,
            connection: None,
        }
    }

    /// Authenticate and open in one step.
    ///
    /// # Errors
    ///
    /// Returns `Unauthenticated` if the token is rejected; nothing is
    /// registered in that case.
    pub fn connect(
        self: &Arc<Self>,
        token: Option<&str>,
    ) -> Result<(Session, mpsc::UnboundedReceiver<ServerEvent>)> {
        let mut handshake = self.handshake();
        handshake.authenticate(token)?;
        handshake.open()
    }

    /// Bring an authenticated connection online.
    ///
    /// The new connection receives the current `online_users` list first; every
    /// other live connection is then told it came online.
    fn go_online(
        self: &Arc<Self>,
        connection: Connection,
    ) -> (Session, mpsc::UnboundedReceiver<ServerEvent>) {
        let (handle, outbox) = ConnectionHandle::new(&connection);
        let own = handle.clone();

        if let Some(previous) = self.presence.register(handle) {
            debug!(
                user = %connection.user_id,
                superseded = %previous.connection_id,
                "Older connection stops receiving pushes"
            );
        }

        // The outbox was just created, so this cannot fail.
        let _ = own.push(ServerEvent::OnlineUsers(self.presence.snapshot()));
        self.router
            .route_presence_change(connection.user_id, &connection.username, true);

        info!(
            connection = %connection.connection_id,
            user = %connection.user_id,
            username = %connection.username,
            "Session online"
        );

        let session = Session {
            gateway: Arc::clone(self),
            connection,
            state: ConnectionState::Online,
        };
        (session, outbox)
    }

    /// The presence registry backing this gateway.
    #[must_use]
    pub fn presence(&self) -> &Arc<PresenceRegistry> {
        &self.presence
    }
}

/// A connection attempt that is not online yet.
///
/// Nothing is registered until [`Handshake::open`], so dropping a handshake
/// at any point leaves presence untouched.
pub struct Handshake {
    gateway: Arc<Gateway>,
    state: ConnectionState,
    connection: Option<Connection>,
}

impl Handshake {
    /// Verify the presented token. A rejected handshake cannot be retried.
    ///
    /// # Errors
    ///
    /// - `Unauthenticated` if the token is missing or invalid
    /// - `InvalidOperation` if this handshake already tried to authenticate
    pub fn authenticate(&mut self, token: Option<&str>) -> Result<&Connection> {
        if self.state != ConnectionState::Connecting {
            return Err(Error::InvalidOperation(
                "handshake already authenticated or rejected".into(),
            ));
        }
        self.state = ConnectionState::Authenticating;

        match self.gateway.auth.authenticate(token) {
            Ok(connection) => Ok(&*self.connection.insert(connection)),
            Err(e) => {
                self.state = ConnectionState::Rejected;
                Err(e)
            }
        }
    }

    /// Register the authenticated connection and go online.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` unless [`Handshake::authenticate`] succeeded.
    pub fn open(mut self) -> Result<(Session, mpsc::UnboundedReceiver<ServerEvent>)> {
        let connection = self
            .connection
            .take()
            .ok_or_else(|| Error::InvalidOperation("handshake is not authenticated".into()))?;
        Ok(self.gateway.go_online(connection))
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }
}

/// Dispatcher for one online connection.
///
/// Dropping a session closes it, so a connection that goes away on any path
/// leaves no presence entry behind.
pub struct Session {
    gateway: Arc<Gateway>,
    connection: Connection,
    state: ConnectionState,
}

impl Session {
    /// Handle one inbound event.
    ///
    /// Returns the push outcome for events that route to another user. A
    /// failed event leaves the session open.
    ///
    /// # Errors
    ///
    /// - `InvalidOperation` if the session is no longer online
    /// - `Validation` or `NotFound` from storing a message
    pub async fn handle(&mut self, event: SessionEvent) -> Result<Option<Delivery>> {
        if self.state != ConnectionState::Online {
            return Err(Error::InvalidOperation("session is not online".into()));
        }

        let sender = self.connection.user_id;
        let delivery = match event {
            SessionEvent::Send {
                receiver_id,
                content,
            } => {
                let message = self
                    .gateway
                    .messages
                    .append(sender, receiver_id, &content)
                    .await?;
                Some(self.gateway.router.route_message(&message))
            }
            SessionEvent::StartTyping { receiver_id } => Some(
                self.gateway
                    .router
                    .route_typing(sender, receiver_id, Typing::Start),
            ),
            SessionEvent::StopTyping { receiver_id } => Some(
                self.gateway
                    .router
                    .route_typing(sender, receiver_id, Typing::Stop),
            ),
            SessionEvent::Disconnect => {
                self.close();
                None
            }
        };
        Ok(delivery)
    }

    /// Leave presence and announce the departure. Idempotent.
    ///
    /// A superseded session leaves quietly: its identity is still online
    /// through the newer connection.
    pub fn close(&mut self) {
        if self.state != ConnectionState::Online {
            return;
        }
        self.state = ConnectionState::Disconnected;

        let user_id = self.connection.user_id;
        if self
            .gateway
            .presence
            .unregister(user_id, &self.connection.connection_id)
        {
            self.gateway
                .router
                .route_presence_change(user_id, &self.connection.username, false);
        } else {
            warn!(
                connection = %self.connection.connection_id,
                user = %user_id,
                "Closing superseded session"
            );
        }

        info!(connection = %self.connection.connection_id, user = %user_id, "Session closed");
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection.connection_id
    }

    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.connection.user_id
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.connection.username
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
