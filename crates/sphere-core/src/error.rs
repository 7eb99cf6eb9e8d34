//! Error taxonomy shared by every component.

use sphere_protocol::UserId;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by the core services.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing, invalid or expired credentials.
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// A token failed signature or expiry verification.
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// A valid refresh token that is not the identity's current one.
    #[error("Refresh token does not match the active session")]
    TokenMismatch,

    /// A referenced record does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// The request is well-formed but not allowed.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Malformed or empty input.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A unique field is already taken.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Best-effort push could not reach the recipient.
    #[error("Recipient {0} has no live connection")]
    DeliveryUnavailable(UserId),

    /// The email/SMS collaborator failed.
    #[error("Notifier failed: {0}")]
    Notifier(String),

    /// Unexpected failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Stable, matchable error kinds for callers that map errors to responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Unauthenticated,
    InvalidToken,
    TokenMismatch,
    NotFound,
    InvalidOperation,
    Validation,
    Conflict,
    DeliveryUnavailable,
    Notifier,
    Internal,
}

impl ErrorKind {
    /// Short machine-readable name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::InvalidToken => "invalid_token",
            ErrorKind::TokenMismatch => "token_mismatch",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidOperation => "invalid_operation",
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::DeliveryUnavailable => "delivery_unavailable",
            ErrorKind::Notifier => "notifier",
            ErrorKind::Internal => "internal",
        }
    }

    /// Whether this kind is an authentication failure.
    #[must_use]
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            ErrorKind::Unauthenticated | ErrorKind::InvalidToken | ErrorKind::TokenMismatch
        )
    }
}

impl Error {
    /// Get the stable kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Unauthenticated(_) => ErrorKind::Unauthenticated,
            Error::InvalidToken(_) => ErrorKind::InvalidToken,
            Error::TokenMismatch => ErrorKind::TokenMismatch,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::InvalidOperation(_) => ErrorKind::InvalidOperation,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::DeliveryUnavailable(_) => ErrorKind::DeliveryUnavailable,
            Error::Notifier(_) => ErrorKind::Notifier,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Message safe to show to a client.
    ///
    /// Every authentication failure reads the same so responses do not reveal
    /// whether a refresh token was replayed, expired or forged.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self.kind() {
            k if k.is_auth_failure() => "Unauthorized: invalid or expired credentials".to_string(),
            ErrorKind::Internal | ErrorKind::Notifier => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }
}
