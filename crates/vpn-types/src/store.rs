//! Persistence boundary
//!
//! Rule and tunnel definitions are persisted through a [`StateStore`], a
//! minimal key-value interface. Managers serialize their state as JSON under
//! a fixed key. [`JsonFileStore`] keeps one file per key in a directory;
//! [`MemoryStore`] keeps everything in process and is used by tests.

use crate::error::{CommonError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::debug;

/// Key-value persistence used by the managers
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the raw value stored under `key`, `None` if never written
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Replace the value stored under `key`
    async fn save(&self, key: &str, value: &[u8]) -> Result<()>;
}

/// Load and deserialize a JSON value
pub async fn load_json<T: DeserializeOwned>(store: &dyn StateStore, key: &str) -> Result<Option<T>> {
    match store.load(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Serialize and save a JSON value
pub async fn save_json<T: Serialize + ?Sized>(store: &dyn StateStore, key: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    store.save(key, &bytes).await
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty()
        || !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(CommonError::validation(format!("Invalid store key '{}'", key)));
    }
    Ok(())
}

/// Directory of `<key>.json` files
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    /// Open (and create if needed) a store rooted at `root`
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.exists() {
            std::fs::create_dir_all(&root).map_err(|e| {
                CommonError::storage(format!(
                    "Cannot create storage directory {}: {}",
                    root.display(),
                    e
                ))
            })?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", key))
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CommonError::storage(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn save(&self, key: &str, value: &[u8]) -> Result<()> {
        validate_key(key)?;
        let path = self.path_for(key);
        let tmp = self.root.join(format!(".{}.json.tmp", key));

        // Write-then-rename so a crash never leaves a truncated file behind
        write_owner_only(&tmp, value).await.map_err(|e| {
            CommonError::storage(format!("Failed to write {}: {}", tmp.display(), e))
        })?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| {
            CommonError::storage(format!("Failed to replace {}: {}", path.display(), e))
        })?;

        debug!(key, path = %path.display(), "state saved");
        Ok(())
    }
}

/// State may hold private keys; files are readable by the owner only
async fn write_owner_only(path: &Path, value: &[u8]) -> std::io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    // A leftover temp file keeps its old mode
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))
            .await?;
    }
    file.write_all(value).await?;
    file.sync_all().await?;
    Ok(())
}

/// In-process store
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail, as if the backing store was lost
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CommonError::storage("Backing store is unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        self.check_available()?;
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn save(&self, key: &str, value: &[u8]) -> Result<()> {
        validate_key(key)?;
        self.check_available()?;
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }
}
