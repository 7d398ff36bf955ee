//! Error taxonomy for the analytics pipeline
//!
//! No error in this crate terminates the process: decode failures skip the
//! message, mirror failures are logged, broker failures are retried with
//! backoff and delivery failures drop one subscriber.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// A broker message could not be turned into an `OrderEvent`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid timestamp: {0:?}")]
    InvalidTimestamp(String),
}

/// A decoded event carried an unusable event-specific field.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("invalid totalAmount: {0}")]
    InvalidAmount(String),

    #[error("status change without newStatus")]
    MissingNewStatus,
}

/// The recent-activity store could not be reached or returned garbage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MirrorError {
    #[error("activity store unavailable: {0}")]
    Unavailable(String),

    #[error("activity store operation timed out after {0}ms")]
    Timeout(u64),

    #[error("activity store returned corrupt data: {0}")]
    Corrupt(String),
}

impl From<redis::RedisError> for MirrorError {
    fn from(err: redis::RedisError) -> Self {
        MirrorError::Unavailable(err.to_string())
    }
}

/// Loss of, or failure talking to, the message broker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("subscription failed: {0}")]
    Subscription(String),

    #[error("offset commit failed: {0}")]
    Commit(String),
}

/// A subscriber could not take a pushed message.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("subscriber connection closed")]
    Closed,

    #[error("subscriber outbound queue full")]
    Lagging,
}

/// Lifecycle misuse of a background task.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors surfaced by the HTTP query layer
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl From<MirrorError> for ApiError {
    fn from(err: MirrorError) -> Self {
        ApiError::ServiceUnavailable(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, code) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, "BAD_REQUEST"),
            ApiError::ServiceUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                msg,
                "SERVICE_UNAVAILABLE",
            ),
        };

        let body = Json(json!({
            "error": code,
            "message": message
        }));

        (status, body).into_response()
    }
}
