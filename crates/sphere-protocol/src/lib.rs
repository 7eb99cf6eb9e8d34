//! # sphere-protocol
//!
//! Wire definitions for the SocialSphere realtime gateway.
//!
//! This crate defines the records and events exchanged between clients and
//! the gateway, along with the codecs used to put them on a socket.
//!
//! ## Events
//!
//! - `sendMessage` / `receiveMessage` - Direct messages
//! - `start_typing` / `stop_typing` - Ephemeral typing indicators
//! - `user_online` / `user_offline` / `online_users` - Presence
//! - `newNotification` - Like, comment and follow notifications
//!
//! ## Example
//!
//! ```rust
//! use sphere_protocol::{codec, ClientEvent, UserId};
//!
//! let event = ClientEvent::StartTyping { receiver_id: UserId::new() };
//!
//! let text = codec::to_json(&event).unwrap();
//! let decoded: ClientEvent = codec::from_json(&text).unwrap();
//! assert_eq!(event, decoded);
//! ```

pub mod codec;
pub mod events;
pub mod types;

pub use codec::{ProtocolError, WireFormat};
pub use events::{ClientEvent, ServerEvent};
pub use types::{ChatMessage, Notification, NotificationKind, OnlineUser, UserId, UserSummary};
