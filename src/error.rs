//! Error types for the sync engine
//!
//! Provides unified error handling using thiserror. Raw failures are carried
//! as `SyncError`; once a failure has been through the classifier it travels
//! as `SyncError::Classified` so every caller sees the same verdict.

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::recovery::ClassifiedError;

// == Sync Error Enum ==
/// Unified error type for the sync engine.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The backend answered with a non-success status
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The request never reached the backend
    #[error("network error: {0}")]
    Network(String),

    /// The call exceeded its fixed timeout
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// A payload could not be decoded into the expected shape
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// The realtime channel failed
    #[error("channel error: {0}")]
    Channel(String),

    /// A send was attempted while the channel is not connected
    #[error("realtime channel is not connected")]
    NotConnected,

    /// Invalid request data
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Key not present in the cache
    #[error("Key not found: {0}")]
    NotFound(String),

    /// Session marker storage failed
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// An error that has already been classified
    #[error(transparent)]
    Classified(#[from] ClassifiedError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            SyncError::Http { status, .. } => Some(*status),
            SyncError::Timeout(_) => Some(408),
            SyncError::Classified(c) => c.context().status,
            _ => None,
        }
    }
}

// == IntoResponse Implementation ==
impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let status = match &self {
            SyncError::NotFound(_) => StatusCode::NOT_FOUND,
            SyncError::InvalidRequest(_) | SyncError::Decode(_) => StatusCode::BAD_REQUEST,
            SyncError::NotConnected | SyncError::Channel(_) => StatusCode::SERVICE_UNAVAILABLE,
            SyncError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            SyncError::Http { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}

// == Result Type Alias ==
/// Convenience Result type for the sync engine.
pub type Result<T> = std::result::Result<T, SyncError>;
