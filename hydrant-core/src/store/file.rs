//! JSON file-backed credential storage.
//!
//! Credentials are kept in a single JSON document at
//! `~/.local/share/hydrant/credentials.json` on Linux (the platform data
//! directory elsewhere). The whole document is rewritten on every change.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::{Secret, SecretStore, StoreError};

/// On-disk document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileStoreData {
    /// Format version.
    version: u32,

    entries: BTreeMap<String, Secret>,
}

impl Default for FileStoreData {
    fn default() -> Self {
        Self {
            version: 1,
            entries: BTreeMap::new(),
        }
    }
}

/// Credential store persisted to a JSON file.
///
/// Reads are served from an in-memory copy; writes update the copy and then
/// flush the file. On Unix the file is created with mode `0600`.
pub struct FileStore {
    path: PathBuf,
    data: RwLock<FileStoreData>,
}

impl FileStore {
    /// Default location of the credentials file.
    pub fn default_path() -> Result<PathBuf, StoreError> {
        let dirs = directories::ProjectDirs::from("com", "raibid-labs", "hydrant")
            .ok_or(StoreError::DataDirUnavailable)?;
        Ok(dirs.data_dir().join("credentials.json"))
    }

    /// Load the store from a specific path.
    ///
    /// Creates parent directories if they don't exist. A missing file is an
    /// empty store; it is written on the first `set`.
    pub fn load_from_path(path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let data = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            serde_json::from_str(&contents)?
        } else {
            FileStoreData::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, data: &FileStoreData) -> Result<(), StoreError> {
        let contents = serde_json::to_string_pretty(data)?;
        write_private(&self.path, contents.as_bytes())?;
        Ok(())
    }
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    fs::write(path, contents)
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("path", &self.path)
            .field("keys_count", &self.data.read().entries.len())
            .finish()
    }
}

#[async_trait]
impl SecretStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Secret>, StoreError> {
        Ok(self.data.read().entries.get(key).cloned())
    }

    async fn set(&self, key: &str, secret: &Secret) -> Result<(), StoreError> {
        let mut data = self.data.write();
        data.entries.insert(key.to_string(), secret.clone());
        self.save(&data)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut data = self.data.write();
        if data.entries.remove(key).is_some() {
            self.save(&data)?;
        }
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .data
            .read()
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
