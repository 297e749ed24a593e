//! Error types shared across the relay.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Why the credential gate rejected a credential.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No credential was presented at all.
    #[error("{0} required")]
    Missing(&'static str),

    /// The `Authorization` value is not `Bearer <token>`.
    #[error("invalid authorization format")]
    MalformedAuthorization,

    /// Signature, audience, expiry or shape check failed.
    #[error("invalid or expired token: {0}")]
    InvalidToken(String),

    /// No verification key is configured for the environment.
    #[error("no verification key configured for environment {0}")]
    NoKey(String),

    /// The presented secret does not match the current secret.
    #[error("invalid secret")]
    SecretMismatch,

    /// The current secret could not be retrieved.
    #[error("secret unavailable: {0}")]
    SecretUnavailable(String),
}

/// Errors raised by a session directory backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("invalid directory value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("unsupported directory url: {0}")]
    UnsupportedUrl(String),
}

/// Why a delivery attempt did not reach the client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("session {0} is unknown")]
    UnknownSession(String),

    #[error("no route to session {0}")]
    NoRoute(String),

    #[error("session {0} has no connection on this instance")]
    NotLocal(String),

    #[error("send to session {session_id} failed: {reason}")]
    SendFailed { session_id: String, reason: String },

    #[error("forward to {instance} failed: {reason}")]
    ForwardFailed { instance: String, reason: String },
}

/// Errors surfaced by the HTTP API, rendered as a JSON error envelope.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(#[from] AuthError),

    #[error("Session {0} not found")]
    UnknownSession(String),

    #[error("Session {0} is not connected")]
    NotConnected(String),

    #[error("{0}")]
    Delivery(DeliveryError),

    #[error("{0}")]
    BadRequest(String),
}

impl From<DeliveryError> for ApiError {
    fn from(error: DeliveryError) -> Self {
        match error {
            DeliveryError::UnknownSession(id) => Self::UnknownSession(id),
            other => Self::Delivery(other),
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::UnknownSession(_) => StatusCode::NOT_FOUND,
            Self::NotConnected(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Delivery(DeliveryError::NotLocal(_)) => StatusCode::NOT_FOUND,
            Self::Delivery(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::UnknownSession(_) => "unknown_session",
            Self::NotConnected(_) => "session_not_connected",
            Self::BadRequest(_) => "bad_request",
            Self::Delivery(DeliveryError::NoRoute(_)) => "no_route",
            Self::Delivery(DeliveryError::NotLocal(_)) => "not_local",
            Self::Delivery(_) => "delivery_failed",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Delivery(_))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
                "retryable": self.retryable(),
                "statusCode": status.as_u16(),
            }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use super::{ApiError, AuthError, DeliveryError};

    #[test]
    fn unknown_session_delivery_maps_to_not_found() {
        let error: ApiError = DeliveryError::UnknownSession("s1".into()).into();
        assert_eq!(error.status(), StatusCode::NOT_FOUND);
        assert_eq!(error.to_string(), "Session s1 not found");
    }

    #[test]
    fn forward_failure_is_bad_gateway_and_retryable() {
        let error: ApiError = DeliveryError::ForwardFailed {
            instance: "server_b".into(),
            reason: "timeout".into(),
        }
        .into();
        assert_eq!(error.status(), StatusCode::BAD_GATEWAY);
        assert!(error.retryable());
    }

    #[test]
    fn auth_errors_are_unauthorized() {
        let error: ApiError = AuthError::MalformedAuthorization.into();
        assert_eq!(error.status(), StatusCode::UNAUTHORIZED);
        assert!(!error.retryable());
    }
}
