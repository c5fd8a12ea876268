//! HTTP transport seam.
//!
//! The coordinator never talks to `reqwest` directly; it hands a
//! [`PreparedRequest`] to a [`Transport`]. A transport error means no
//! response arrived at all. Any HTTP status, including 401 and 5xx, is a
//! successful transport result.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use reqwest::header::HeaderMap;
use thiserror::Error;
use url::Url;

use crate::model::ApiResponse;

/// Error type for transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection could not be established or was dropped.
    #[error("connection failed: {message}")]
    Connect { message: String },

    /// No response within the transport timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Any other failure before a status line was received.
    #[error("transport failure: {message}")]
    Other { message: String },
}

/// A request with its absolute URL and final headers.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<serde_json::Value>,
}

/// Executes prepared requests.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: PreparedRequest) -> Result<ApiResponse, TransportError>;
}

/// [`Transport`] backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    timeout: Option<Duration>,
}

impl ReqwestTransport {
    /// Transport with no per-request timeout.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout: None,
        }
    }

    /// Transport that gives up on requests after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout: Some(timeout),
        }
    }

    /// Use a preconfigured client (custom TLS, proxies).
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn classify(&self, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout(self.timeout.unwrap_or_default())
        } else if e.is_connect() {
            TransportError::Connect {
                message: e.to_string(),
            }
        } else {
            TransportError::Other {
                message: e.to_string(),
            }
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: PreparedRequest) -> Result<ApiResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);

        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(|e| self.classify(e))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| self.classify(e))?;

        Ok(ApiResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }
}
