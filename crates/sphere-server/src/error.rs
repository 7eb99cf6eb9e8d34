//! HTTP mapping of core errors.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use sphere_core::{Error, ErrorKind};
use thiserror::Error;
use tracing::error;

use crate::metrics;

/// Error returned by HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] Error),

    /// The request could not be understood, before reaching any service.
    #[error("{0}")]
    BadRequest(String),

    /// The server is at its connection limit.
    #[error("server is at capacity")]
    Unavailable,
}

impl ApiError {
    /// HTTP status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Core(e) => status_for(e.kind()),
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Message safe to return to a client.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            ApiError::Core(e) => e.public_message(),
            other => other.to_string(),
        }
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Unauthenticated | ErrorKind::InvalidToken | ErrorKind::TokenMismatch => {
            StatusCode::UNAUTHORIZED
        }
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidOperation | ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::DeliveryUnavailable | ErrorKind::Notifier | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if let ApiError::Core(e) = &self {
            if status.is_server_error() {
                error!(error = %e, "Request failed");
            }
            metrics::record_error(e.kind().as_str());
        }

        let body = Json(serde_json::json!({
            "success": false,
            "error": self.public_message(),
        }));
        (status, body).into_response()
    }
}

/// Result alias for handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use sphere_core::UserId;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (Error::Unauthenticated("x".into()), StatusCode::UNAUTHORIZED),
            (Error::InvalidToken("x".into()), StatusCode::UNAUTHORIZED),
            (Error::TokenMismatch, StatusCode::UNAUTHORIZED),
            (Error::NotFound("identity"), StatusCode::NOT_FOUND),
            (Error::InvalidOperation("x".into()), StatusCode::BAD_REQUEST),
            (Error::Validation("x".into()), StatusCode::BAD_REQUEST),
            (Error::Conflict("x".into()), StatusCode::CONFLICT),
            (
                Error::DeliveryUnavailable(UserId::new()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (Error::Notifier("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (Error::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
        assert_eq!(
            ApiError::BadRequest("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_auth_failures_share_a_message() {
        let mismatch = ApiError::from(Error::TokenMismatch).public_message();
        let invalid = ApiError::from(Error::InvalidToken("ExpiredSignature".into())).public_message();
        assert_eq!(mismatch, invalid);
        assert!(!invalid.contains("Expired"));
    }

    #[test]
    fn test_internal_details_hidden() {
        let message = ApiError::from(Error::Internal("db password wrong".into())).public_message();
        assert_eq!(message, "Internal server error");
    }
}
