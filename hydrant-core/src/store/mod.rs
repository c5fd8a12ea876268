//! Key/value persistence for session credentials.
//!
//! Backends hold opaque strings; [`Session`](crate::session::Session) decides
//! which keys exist and what they mean. Keys are namespaced as
//! `hydrant/{namespace}/{credential_type}`.
//!
//! | Backend | Lifetime | Notes |
//! |---|---|---|
//! | [`MemoryStore`] | process | tests, throwaway sessions |
//! | [`FileStore`] | disk | `credentials.json` under the data dir, mode 0600 |
//! | `KeyringStore` | OS keyring | `keyring-store` feature, cannot list keys |
//!
//! ```rust,ignore
//! use hydrant_core::store::{MemoryStore, Secret, SecretStore};
//!
//! let store = MemoryStore::new();
//! store.set("hydrant/default/access_token", &Secret::new("eyJhbGciOi...")).await?;
//! assert!(store.exists("hydrant/default/access_token").await?);
//! ```

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

mod file;
mod memory;
#[cfg(feature = "keyring-store")]
mod keyring;

pub use file::FileStore;
pub use memory::MemoryStore;
#[cfg(feature = "keyring-store")]
pub use keyring::KeyringStore;

/// Token material. Formatting never prints the value and the buffer is
/// zeroed on drop; read it with [`expose`](Secret::expose).
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the raw value. Do not log it.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Take the raw value out, leaving an empty buffer to be zeroed.
    pub fn into_inner(mut self) -> String {
        std::mem::take(&mut self.0)
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret([REDACTED])")
    }
}

impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Secret {}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend error: {message}")]
    BackendError { message: String },

    /// I/O error reading or writing a file-backed store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The credentials file is not valid JSON.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// No usable keyring on this platform.
    #[error("keyring not available: {message}")]
    KeyringUnavailable { message: String },

    /// No platform data directory could be determined.
    #[error("data directory not available")]
    DataDirUnavailable,
}

/// Abstraction over credential storage backends.
///
/// Stores hold plain strings keyed by strings; they know nothing about
/// tokens. The [`Session`](crate::session::Session) layer gives the keys
/// meaning.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// `Ok(None)` when nothing is stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Secret>, StoreError>;

    /// Insert or overwrite.
    async fn set(&self, key: &str, secret: &Secret) -> Result<(), StoreError>;

    /// Remove `key`; removing a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Keys starting with `prefix`, in no particular order unless the
    /// backend says otherwise.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }
}

/// Which storage backend a coordinator should persist credentials in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreBackend {
    /// Process-local memory; credentials vanish on exit.
    Memory,

    /// JSON file. `None` means `{data_dir}/credentials.json`.
    File { path: Option<PathBuf> },

    /// OS keyring, falling back to memory when unavailable.
    Keyring,
}

impl Default for StoreBackend {
    fn default() -> Self {
        Self::File { path: None }
    }
}

/// Create a secret store for the configured backend.
///
/// - [`StoreBackend::Memory`] always succeeds.
/// - [`StoreBackend::File`] loads (or creates) the JSON file.
/// - [`StoreBackend::Keyring`] attempts a [`KeyringStore`] and falls back to
///   [`MemoryStore`] with a warning if the keyring is unavailable or the
///   `keyring-store` feature is disabled.
pub fn create_store(backend: &StoreBackend) -> Result<Box<dyn SecretStore>, StoreError> {
    match backend {
        StoreBackend::Memory => {
            tracing::debug!("Using in-memory credential storage");
            Ok(Box::new(MemoryStore::new()))
        }
        StoreBackend::File { path } => {
            let path = match path {
                Some(path) => path.clone(),
                None => FileStore::default_path()?,
            };
            tracing::debug!(path = %path.display(), "Using file credential storage");
            Ok(Box::new(FileStore::load_from_path(path)?))
        }
        StoreBackend::Keyring => Ok(keyring_or_memory()),
    }
}

#[cfg(feature = "keyring-store")]
fn keyring_or_memory() -> Box<dyn SecretStore> {
    match KeyringStore::try_new("hydrant") {
        Ok(store) => {
            tracing::info!("Using OS keyring for credential storage");
            Box::new(store)
        }
        Err(e) => {
            tracing::warn!(
                "Keyring unavailable ({}), falling back to memory store. \
                 Credentials will not persist across restarts.",
                e
            );
            Box::new(MemoryStore::new())
        }
    }
}

#[cfg(not(feature = "keyring-store"))]
fn keyring_or_memory() -> Box<dyn SecretStore> {
    tracing::warn!(
        "Keyring storage requested but keyring-store feature not enabled. \
         Using memory store. Credentials will not persist across restarts."
    );
    Box::new(MemoryStore::new())
}
