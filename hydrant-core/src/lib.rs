//! # Hydrant Core
//!
//! Authenticated HTTP requests for the utility dashboards' REST API.
//!
//! This crate provides:
//! - [`Coordinator`] - attaches bearer credentials and transparently refreshes
//!   an expired access token, replaying every request that was waiting on it
//! - [`Session`] - the injectable credential context a coordinator reads from
//! - [`RefreshGate`] - the single-flight `{Idle, Refreshing}` state machine
//! - Credential stores (memory, JSON file, OS keyring)
//! - [`ClientConfig`] - TOML configuration
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use hydrant_core::{ApiRequest, Coordinator, RequestError};
//!
//! async fn open_leaks(coordinator: &Coordinator) -> Result<String, RequestError> {
//!     let response = coordinator.send(ApiRequest::get("/api/leaks?status=open")).await?;
//!     Ok(response.text())
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod model;
pub mod refresh;
pub mod session;
pub mod store;
pub mod transport;

// Re-export commonly used types at crate root
pub use config::{
    ClientConfig,
    ConfigError,
    ExpiredSignal,
};

pub use coordinator::Coordinator;

pub use error::{
    HydrantError,
    RequestError,
};

pub use model::{
    ApiRequest,
    ApiResponse,
    CredentialType,
};

pub use refresh::{
    Admission,
    Attempt,
    RefreshGate,
    RefreshState,
};

pub use session::{
    Credential,
    Session,
};

pub use store::{
    FileStore,
    MemoryStore,
    Secret,
    SecretStore,
    StoreBackend,
    StoreError,
    create_store,
};

#[cfg(feature = "keyring-store")]
pub use store::KeyringStore;

pub use reqwest::{Method, StatusCode};

pub use transport::{
    PreparedRequest,
    ReqwestTransport,
    Transport,
    TransportError,
};
