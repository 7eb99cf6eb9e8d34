//! # sphere-core
//!
//! Sessions, presence and delivery for the SocialSphere backend.
//!
//! This crate provides the building blocks behind the HTTP API and the
//! realtime gateway:
//!
//! - **TokenService** - Access/refresh token issuance, rotation and revocation
//! - **UserDirectory** - Identities, the follow graph and the stored refresh hash
//! - **GatewayAuth** - Authenticates realtime connections with access tokens
//! - **PresenceRegistry** - Who is online and which connection reaches them
//! - **MessageStore** / **NotificationCenter** - Durable messages and notifications
//! - **DeliveryRouter** - Fan-out of events to live connections
//! - **Gateway** - One dispatcher per connection
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────────┐
//! │   Session   │────▶│  Gateway    │────▶│  MessageStore    │
//! └─────────────┘     └─────────────┘     └──────────────────┘
//!        │                   │
//!        ▼                   ▼
//! ┌─────────────┐     ┌────────────────┐     ┌──────────────────┐
//! │ GatewayAuth │     │ DeliveryRouter │────▶│ PresenceRegistry │
//! └─────────────┘     └────────────────┘     └──────────────────┘
//!        │                   │
//!        ▼                   ▼
//! ┌──────────────┐    ┌────────────────────┐
//! │ TokenService │    │ NotificationCenter │
//! └──────────────┘    └────────────────────┘
//! ```

pub mod accounts;
pub mod auth;
pub mod directory;
pub mod engagement;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod messages;
pub mod notifications;
pub mod notifier;
pub mod password;
pub mod presence;
pub mod router;
pub mod secrets;
pub mod tokens;

pub use accounts::{AccountService, AccountSettings, NewAccount};
pub use auth::{Connection, ConnectionId, GatewayAuth};
pub use directory::{FollowOutcome, MemoryDirectory, UserDirectory};
pub use engagement::Engagement;
pub use error::{Error, ErrorKind, Result};
pub use gateway::{ConnectionState, Gateway, Handshake, Session, SessionEvent};
pub use identity::{Identity, PendingSecret, Profile, SecretKind};
pub use messages::{MemoryMessageLog, MessageLog, MessageStore};
pub use notifications::{
    MemoryNotificationLog, NewNotification, NotificationCenter, NotificationLog, NotificationView,
};
pub use notifier::{LogNotifier, Notifier, NotifierError};
pub use presence::{ConnectionHandle, PresenceRegistry};
pub use router::{Delivery, DeliveryRouter, Typing};
pub use tokens::{AccessClaims, RefreshClaims, TokenConfig, TokenPair, TokenService};

pub use sphere_protocol::{
    ChatMessage, ClientEvent, Notification, NotificationKind, OnlineUser, ServerEvent, UserId,
    UserSummary,
};
