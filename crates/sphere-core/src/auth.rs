//! Authentication of realtime connections.
//!
//! A connection presents an access token at handshake time. Verification uses
//! the same secret as the HTTP API and trusts the embedded claims for the
//! lifetime of the connection: storage is not consulted, so a revoked access
//! token keeps working for live sockets until it expires.

use chrono::{DateTime, Utc};
use sphere_protocol::UserId;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::tokens::TokenService;

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", Uuid::new_v4().simple()))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An authenticated realtime connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub username: String,
    pub authenticated_at: DateTime<Utc>,
}

/// Verifies access tokens presented by realtime connections.
#[derive(Clone)]
pub struct GatewayAuth {
    tokens: Arc<TokenService>,
}

impl GatewayAuth {
    /// Create an authenticator using `tokens` for verification.
    #[must_use]
    pub fn new(tokens: Arc<TokenService>) -> Self {
        Self { tokens }
    }

    /// Authenticate a connection attempt.
    ///
    /// # Errors
    ///
    /// Returns `Unauthenticated` if the token is missing or fails
    /// verification. The attempt must then be dropped before registration.
    pub fn authenticate(&self, raw_token: Option<&str>) -> Result<Connection> {
        let token = raw_token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Unauthenticated("missing access token".into()))?;

        let claims = self.tokens.verify_access(token).map_err(|e| {
            warn!(error = %e, "Gateway authentication failed");
            Error::Unauthenticated("invalid or expired access token".into())
        })?;

        let connection = Connection {
            connection_id: ConnectionId::generate(),
            user_id: claims.id,
            username: claims.username,
            authenticated_at: Utc::now(),
        };

        debug!(
            connection = %connection.connection_id,
            user = %connection.user_id,
            "Connection authenticated"
        );
        Ok(connection)
    }
}
