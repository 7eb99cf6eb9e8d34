//! Event types for the realtime gateway.
//!
//! Every event is an object with an `event` name and a `data` payload.
//! Inbound events come from clients, outbound events are pushed by the server.

use serde::{Deserialize, Serialize};

use crate::types::{ChatMessage, Notification, OnlineUser, UserId};

/// An event sent by a client over an authenticated connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// Send a direct message.
    #[serde(rename = "sendMessage")]
    SendMessage {
        /// Recipient of the message.
        receiver_id: UserId,
        /// Message body.
        content: String,
    },

    /// The sender started typing to `receiver_id`.
    #[serde(rename = "start_typing")]
    StartTyping {
        /// Who should see the indicator.
        receiver_id: UserId,
    },

    /// The sender stopped typing to `receiver_id`.
    #[serde(rename = "stop_typing")]
    StopTyping {
        /// Who should see the indicator.
        receiver_id: UserId,
    },
}

impl ClientEvent {
    /// Wire name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::SendMessage { .. } => "sendMessage",
            ClientEvent::StartTyping { .. } => "start_typing",
            ClientEvent::StopTyping { .. } => "stop_typing",
        }
    }
}

/// An event pushed by the server to a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// A direct message addressed to this connection's user.
    #[serde(rename = "receiveMessage")]
    ReceiveMessage(ChatMessage),

    /// Someone started typing to this user.
    #[serde(rename = "user_typing_start")]
    UserTypingStart {
        /// Who is typing.
        sender_id: UserId,
    },

    /// Someone stopped typing to this user.
    #[serde(rename = "user_typing_stop")]
    UserTypingStop {
        /// Who stopped typing.
        sender_id: UserId,
    },

    /// Another user came online.
    #[serde(rename = "user_online")]
    UserOnline(OnlineUser),

    /// Another user went offline.
    #[serde(rename = "user_offline")]
    UserOffline(OnlineUser),

    /// Everyone online, sent once right after registration.
    #[serde(rename = "online_users")]
    OnlineUsers(Vec<OnlineUser>),

    /// A like, comment or follow notification.
    #[serde(rename = "newNotification")]
    NewNotification(Notification),

    /// An inbound event could not be handled. The connection stays open.
    #[serde(rename = "error")]
    Error {
        /// Stable error code.
        code: u16,
        /// Human-readable message.
        message: String,
    },
}

impl ServerEvent {
    /// Wire name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::ReceiveMessage(_) => "receiveMessage",
            ServerEvent::UserTypingStart { .. } => "user_typing_start",
            ServerEvent::UserTypingStop { .. } => "user_typing_stop",
            ServerEvent::UserOnline(_) => "user_online",
            ServerEvent::UserOffline(_) => "user_offline",
            ServerEvent::OnlineUsers(_) => "online_users",
            ServerEvent::NewNotification(_) => "newNotification",
            ServerEvent::Error { .. } => "error",
        }
    }

    /// Create an error event.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code,
            message: message.into(),
        }
    }
}
