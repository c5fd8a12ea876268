//! Client configuration handling.
//!
//! Configuration lives in `client.toml` under the platform config directory
//! (`~/.config/hydrant/client.toml` on Linux). Every field has a default, so
//! a missing file or an empty one yields a working local configuration.
//!
//! ```toml
//! base_url = "https://gis.example.org/api/"
//! namespace = "gis"
//! refresh_timeout_secs = 15
//!
//! [expired_signal]
//! status = 401
//! field = "message"
//! marker = "jwt expired"
//!
//! [store]
//! kind = "keyring"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::store::StoreBackend;

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config from {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {message}")]
    Invalid { message: String },

    #[error("configuration directory not available")]
    ConfigDirUnavailable,
}

/// The server response that means "access token expired, refresh it".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpiredSignal {
    /// HTTP status code of the signal.
    pub status: u16,

    /// Top-level JSON field carrying the marker.
    pub field: String,

    /// Value of `field` that identifies an expired token.
    pub marker: String,
}

impl Default for ExpiredSignal {
    fn default() -> Self {
        Self {
            status: 401,
            field: "message".to_string(),
            marker: "jwt expired".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Root of the remote API. Request paths are joined onto it.
    pub base_url: Url,

    /// Session namespace; separates credentials of different tenants.
    pub namespace: String,

    /// Login endpoint, relative to `base_url`.
    pub login_path: String,

    /// Refresh endpoint, relative to `base_url`.
    pub refresh_path: String,

    pub expired_signal: ExpiredSignal,

    /// Upper bound on the refresh call. `0` disables the bound.
    pub refresh_timeout_secs: u64,

    /// Per-request transport timeout. `0` disables it.
    pub request_timeout_secs: u64,

    pub store: StoreBackend,

    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,

    /// Path of the file this configuration was loaded from.
    #[serde(skip)]
    pub config_path: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            namespace: crate::session::DEFAULT_NAMESPACE.to_string(),
            login_path: "/auth/login".to_string(),
            refresh_path: "/auth/refresh".to_string(),
            expired_signal: ExpiredSignal::default(),
            refresh_timeout_secs: 30,
            request_timeout_secs: 30,
            store: StoreBackend::default(),
            log_level: "info".to_string(),
            config_path: PathBuf::new(),
        }
    }
}

fn default_base_url() -> Url {
    Url::parse("http://localhost:3000/").expect("static URL is valid")
}

impl ClientConfig {
    /// Configuration pointed at `base_url` with every other field defaulted.
    pub fn for_base_url(base_url: Url) -> Self {
        Self {
            base_url,
            ..Self::default()
        }
    }

    pub fn refresh_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.refresh_timeout_secs)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.request_timeout_secs)
    }

    /// Check the invariants serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.base_url.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid {
                message: format!("base_url must be http or https, got {}", self.base_url),
            });
        }
        if self.namespace.is_empty() || self.namespace.contains('/') {
            return Err(ConfigError::Invalid {
                message: format!("namespace must be non-empty without '/': {:?}", self.namespace),
            });
        }
        if !(400..600).contains(&self.expired_signal.status) {
            return Err(ConfigError::Invalid {
                message: format!(
                    "expired_signal.status must be an error status, got {}",
                    self.expired_signal.status
                ),
            });
        }
        Ok(())
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Default location of `client.toml`.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    project_dirs()
        .map(|d| d.config_dir().join("client.toml"))
        .ok_or(ConfigError::ConfigDirUnavailable)
}

/// Load configuration from the default location or fall back to defaults.
pub fn load_config() -> Result<ClientConfig, ConfigError> {
    load_config_from(&default_config_path()?)
}

/// Load configuration from `path`; a missing file yields defaults.
pub fn load_config_from(path: &Path) -> Result<ClientConfig, ConfigError> {
    let mut config = if path.exists() {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?
    } else {
        ClientConfig::default()
    };

    config.config_path = path.to_path_buf();
    config.validate()?;

    Ok(config)
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "raibid-labs", "hydrant")
}
