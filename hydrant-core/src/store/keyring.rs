//! OS keyring-backed credential storage.

use async_trait::async_trait;
use keyring::Entry;

use super::{Secret, SecretStore, StoreError};

/// Account name every hydrant keyring entry is filed under.
const KEYRING_USER: &str = "hydrant";

/// Credential store in the platform keyring (Keychain, Secret Service,
/// Credential Manager).
///
/// A store key `k` becomes the entry `{service}/{k}` owned by `hydrant`.
/// Keyrings cannot be enumerated, so [`list_keys`](SecretStore::list_keys)
/// always fails; sessions address every component by name.
#[derive(Debug)]
pub struct KeyringStore {
    service: String,
}

fn keyring_failure(action: &str, err: keyring::Error) -> StoreError {
    let message = match err {
        keyring::Error::PlatformFailure(inner) => format!("{action}: platform failure: {inner}"),
        keyring::Error::Ambiguous(_) => format!("{action}: several entries match"),
        other => format!("{action}: {other}"),
    };
    StoreError::BackendError { message }
}

impl KeyringStore {
    /// Open the keyring under `service`, failing with
    /// [`StoreError::KeyringUnavailable`] when the platform has none.
    pub fn try_new(service: &str) -> Result<Self, StoreError> {
        Entry::new(&format!("{service}/.probe"), KEYRING_USER).map_err(|e| {
            StoreError::KeyringUnavailable {
                message: e.to_string(),
            }
        })?;

        Ok(Self {
            service: service.to_string(),
        })
    }

    fn entry(&self, key: &str) -> Result<Entry, StoreError> {
        Entry::new(&format!("{}/{}", self.service, key), KEYRING_USER)
            .map_err(|e| keyring_failure("open entry", e))
    }
}

#[async_trait]
impl SecretStore for KeyringStore {
    async fn get(&self, key: &str) -> Result<Option<Secret>, StoreError> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(Secret::new(value))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(keyring_failure(&format!("read {key}"), e)),
        }
    }

    async fn set(&self, key: &str, secret: &Secret) -> Result<(), StoreError> {
        self.entry(key)?
            .set_password(secret.expose())
            .map_err(|e| keyring_failure(&format!("write {key}"), e))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(keyring_failure(&format!("delete {key}"), e)),
        }
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Err(StoreError::BackendError {
            message: format!("keyring entries cannot be listed (prefix {prefix})"),
        })
    }
}
