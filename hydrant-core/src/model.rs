//! Request and response types for the coordinator.
//!
//! - [`ApiRequest`] - An outbound call relative to the API base URL
//! - [`ApiResponse`] - A fully buffered response
//! - [`CredentialType`] - Which piece of a credential a storage key holds

use std::fmt;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RequestError;

/// Type of credential component stored for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    /// Bearer token attached to every authenticated call.
    AccessToken,

    /// Token exchanged for a new access token on expiry.
    RefreshToken,

    /// Name of the user that logged in.
    Username,

    /// RFC 3339 timestamp of the last login or refresh.
    RefreshedAt,
}

impl CredentialType {
    /// All components, in the order they are written.
    pub const ALL: [CredentialType; 4] = [
        Self::AccessToken,
        Self::RefreshToken,
        Self::Username,
        Self::RefreshedAt,
    ];

    /// Get the credential type as a string for storage keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AccessToken => "access_token",
            Self::RefreshToken => "refresh_token",
            Self::Username => "username",
            Self::RefreshedAt => "refreshed_at",
        }
    }
}

impl fmt::Display for CredentialType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outbound API call.
///
/// `path` is resolved against the configured base URL when the request is
/// sent, so a replay after a refresh targets the same endpoint with only the
/// `Authorization` header changed.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    /// Correlation id for log lines.
    pub id: Uuid,

    pub method: Method,

    /// Path relative to the API base URL (e.g. `/api/assets/42`).
    pub path: String,

    /// Extra headers. `Authorization` is always overwritten on send.
    pub headers: HeaderMap,

    /// JSON body, if any.
    pub body: Option<serde_json::Value>,

    /// Whether this request opts out of credential handling.
    pub skip_auth: bool,
}

impl ApiRequest {
    /// Create a request with the given method and path.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
            skip_auth: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Attach a JSON body.
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Serialize a value as the JSON body.
    pub fn with_json<T: Serialize>(self, body: &T) -> Result<Self, RequestError> {
        let value = serde_json::to_value(body).map_err(|e| RequestError::InvalidRequest {
            message: format!("body is not serializable: {}", e),
        })?;
        Ok(self.with_body(value))
    }

    /// Add a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Mark this request as bypassing authentication.
    ///
    /// Such requests must go through
    /// [`Coordinator::send_unauthenticated`](crate::Coordinator::send_unauthenticated).
    pub fn skip_auth(mut self) -> Self {
        self.skip_auth = true;
        self
    }
}

/// A buffered HTTP response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Body decoded as UTF-8, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Deserialize the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, RequestError> {
        serde_json::from_slice(&self.body).map_err(|e| RequestError::Decode {
            message: e.to_string(),
        })
    }

    /// Read a top-level string field from a JSON object body.
    ///
    /// Returns `None` for non-JSON bodies, non-objects and non-string fields.
    pub fn json_field(&self, field: &str) -> Option<String> {
        let value: serde_json::Value = serde_json::from_slice(&self.body).ok()?;
        value.get(field)?.as_str().map(str::to_string)
    }
}
