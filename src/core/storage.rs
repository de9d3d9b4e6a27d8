//! Key/value persistence used for the transcript and small client state.
//!
//! Values are JSON strings stored under fixed keys. Callers treat every
//! failure as non-fatal: the in-memory state stays authoritative.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Storage key for both agents' transcripts
pub const HISTORY_KEY: &str = "history_v1";

/// Storage key for the focused agent
pub const CURRENT_AGENT_KEY: &str = "current_system_v1";

/// Storage key for the backend's canonical user id
pub const HISTORY_USER_KEY: &str = "history_user_id_v1";

/// Errors that can occur reading or writing storage
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Minimal string key/value store
pub trait KeyValueStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
}

/// One file per key inside a directory
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Storage under the configured home (`$SISILINK_HOME/storage`)
    pub fn open_default() -> anyhow::Result<Self> {
        Ok(Self::new(crate::config::storage_dir()?))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
            && !key.starts_with('.');
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", key)))
    }
}

impl KeyValueStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        fs::create_dir_all(&self.dir)?;

        // Serialize writers from other processes sharing the directory
        let lock_path = self.dir.join(format!(".{}.lock", key));
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;
        lock.lock_exclusive()?;

        let tmp_path = self.dir.join(format!(".{}.tmp", key));
        let result = (|| -> Result<(), StorageError> {
            let mut tmp = fs::File::create(&tmp_path)?;
            tmp.write_all(value.as_bytes())?;
            tmp.sync_all()?;
            fs::rename(&tmp_path, &path)?;
            Ok(())
        })();

        let _ = lock.unlock();
        result
    }
}

/// In-process storage for tests and ephemeral sessions
#[derive(Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let values = self
            .values
            .lock()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut values = self
            .values
            .lock()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

impl<S: KeyValueStorage + ?Sized> KeyValueStorage for Arc<S> {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        (**self).set(key, value)
    }
}

/// Writes values on a dedicated task so callers never wait on disk.
///
/// Writes still pending when the next batch is picked up coalesce to the
/// latest value per key.
pub struct BackgroundWriter {
    tx: mpsc::UnboundedSender<(String, String)>,
    task: JoinHandle<()>,
}

impl BackgroundWriter {
    /// Spawn the writer task on the current tokio runtime
    pub fn spawn(storage: Arc<dyn KeyValueStorage>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, String)>();
        let task = tokio::spawn(async move {
            while let Some((key, value)) = rx.recv().await {
                let mut batch = HashMap::new();
                batch.insert(key, value);
                while let Ok((key, value)) = rx.try_recv() {
                    batch.insert(key, value);
                }

                let storage = storage.clone();
                let written = tokio::task::spawn_blocking(move || {
                    for (key, value) in batch {
                        if let Err(e) = storage.set(&key, &value) {
                            warn!(key = %key, "Background write failed: {}", e);
                        }
                    }
                })
                .await;
                if let Err(e) = written {
                    warn!("Background write task failed: {}", e);
                }
            }
            debug!("Background writer stopped");
        });
        Self { tx, task }
    }

    /// Queue a write; returns immediately
    pub fn submit(&self, key: &str, value: String) {
        if self.tx.send((key.to_string(), value)).is_err() {
            warn!(key = %key, "Background writer gone; write dropped");
        }
    }

    /// Finish every queued write, then stop
    pub async fn close(self) {
        drop(self.tx);
        if let Err(e) = self.task.await {
            warn!("Background writer panicked: {}", e);
        }
    }
}
