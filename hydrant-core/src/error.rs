//! Error types for Hydrant.

use reqwest::StatusCode;
use thiserror::Error;

use crate::config::ConfigError;
use crate::store::StoreError;
use crate::transport::TransportError;

/// Error returned to callers of the coordinator.
///
/// `AuthExpired` and `Interrupted` come from credential recovery; every
/// other variant describes the call itself and is passed through unchanged.
#[derive(Debug, Clone, Error)]
pub enum RequestError {
    /// No response was received.
    #[error("network error: {message}")]
    Network { message: String },

    /// The credential expired and could not be refreshed. The session has
    /// been cleared and the caller should force a new login.
    #[error("authentication expired: {message}")]
    AuthExpired { message: String },

    /// The refresh this request was waiting on was abandoned before it
    /// settled. Its outcome is unknown, so the session is left as it was
    /// and the request may be sent again.
    #[error("refresh interrupted: {message}")]
    Interrupted { message: String },

    /// The server answered with a non-success status that is not the
    /// expired-credential signal.
    #[error("server returned {status}: {body}")]
    Server { status: StatusCode, body: String },

    /// The request cannot be sent as built.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// The session store failed while reading or writing the credential.
    #[error("storage error: {message}")]
    Store { message: String },

    /// The response body did not have the expected shape.
    #[error("failed to decode response: {message}")]
    Decode { message: String },
}

impl RequestError {
    /// Whether the caller should send the user back to login.
    pub fn requires_login(&self) -> bool {
        matches!(self, Self::AuthExpired { .. })
    }
}

impl From<StoreError> for RequestError {
    fn from(e: StoreError) -> Self {
        Self::Store {
            message: e.to_string(),
        }
    }
}

impl From<TransportError> for RequestError {
    fn from(e: TransportError) -> Self {
        Self::Network {
            message: e.to_string(),
        }
    }
}

/// Top-level error type encompassing all Hydrant errors.
#[derive(Debug, Error)]
pub enum HydrantError {
    /// Error from credential storage.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Error from an API call.
    #[error("request error: {0}")]
    Request(#[from] RequestError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}
