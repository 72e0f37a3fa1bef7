//! Local file-based state storage backend.
//!
//! This module provides the default file-based state storage for
//! single-machine use. Writes go to a temporary file that is synced and
//! renamed over the state file.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{CairnError, Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, holder_or_generated};
use super::store::StateStore;
use super::types::StateDocument;

/// Default state directory name.
pub const STATE_DIR: &str = ".cairn";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
}

impl LocalStateStore {
    /// Creates a new local state store under `.cairn` in the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| CairnError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
        }
    }

    /// Creates a new local state store from a custom state file path.
    #[must_use]
    pub fn with_state_path(state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let base_dir = state_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let lock_path = state_path.with_extension("lock");

        Self {
            base_dir,
            state_path,
            lock_path,
        }
    }

    /// Path to the state file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                CairnError::State(StateError::backend(format!(
                    "Failed to create state directory: {e}"
                )))
            })?;
        }
        Ok(())
    }

    /// Writes `content` to `path` via a synced temporary file and rename.
    async fn write_durably(&self, path: &Path, content: &str) -> Result<()> {
        self.ensure_dir().await?;

        let mut temp_path = path.as_os_str().to_owned();
        temp_path.push(".tmp");
        let temp_path = PathBuf::from(temp_path);

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            CairnError::State(StateError::backend(format!(
                "Failed to create temp file {}: {e}",
                temp_path.display()
            )))
        })?;

        file.write_all(content.as_bytes()).await.map_err(|e| {
            CairnError::State(StateError::backend(format!("Failed to write state file: {e}")))
        })?;

        file.sync_all().await.map_err(|e| {
            CairnError::State(StateError::backend(format!("Failed to sync state file: {e}")))
        })?;

        fs::rename(&temp_path, path).await.map_err(|e| {
            CairnError::State(StateError::backend(format!("Failed to rename state file: {e}")))
        })?;

        Ok(())
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        if !self.lock_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.lock_path).await.map_err(|e| {
            CairnError::State(StateError::Corrupted {
                message: format!("Failed to read lock file: {e}"),
            })
        })?;

        let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| {
            CairnError::State(StateError::Corrupted {
                message: format!("Failed to parse lock file: {e}"),
            })
        })?;

        Ok(Some(lock_info))
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self) -> Result<()> {
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path).await.map_err(|e| {
                CairnError::State(StateError::LockFailed {
                    message: format!("Failed to delete lock file: {e}"),
                })
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<StateDocument>> {
        if !self.state_path.exists() {
            debug!("State file does not exist: {}", self.state_path.display());
            return Ok(None);
        }

        debug!("Loading state from: {}", self.state_path.display());

        let content = fs::read_to_string(&self.state_path).await.map_err(|e| {
            CairnError::State(StateError::Corrupted {
                message: format!("Failed to read state file: {e}"),
            })
        })?;

        let state: StateDocument = serde_json::from_str(&content).map_err(|e| {
            CairnError::State(StateError::Corrupted {
                message: format!("Failed to parse state file: {e}"),
            })
        })?;

        Ok(Some(state))
    }

    async fn save(&self, state: &StateDocument) -> Result<()> {
        debug!(
            "Saving state serial {} to: {}",
            state.serial,
            self.state_path.display()
        );

        let content = serde_json::to_string_pretty(state).map_err(|e| {
            CairnError::State(StateError::serialization(format!(
                "Failed to serialize state: {e}"
            )))
        })?;

        self.write_durably(&self.state_path, &content).await
    }

    async fn delete(&self) -> Result<()> {
        if self.state_path.exists() {
            info!("Deleting state file: {}", self.state_path.display());
            fs::remove_file(&self.state_path).await.map_err(|e| {
                CairnError::State(StateError::backend(format!(
                    "Failed to delete state file: {e}"
                )))
            })?;
        }

        self.delete_lock_file().await?;

        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock_file().await? {
            if !existing.is_expired() {
                return Err(CairnError::State(StateError::LockedByOther {
                    holder: existing.holder.clone(),
                    since: existing.acquired_at.to_rfc3339(),
                }));
            }
            debug!("Expired lock found, taking over");
        }

        let lock_info = LockInfo::new(&holder_or_generated(holder), operation);

        let content = serde_json::to_string_pretty(&lock_info).map_err(|e| {
            CairnError::State(StateError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })?;

        self.write_durably(&self.lock_path, &content)
            .await
            .map_err(|e| {
                CairnError::State(StateError::LockFailed {
                    message: e.to_string(),
                })
            })?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        self.delete_lock_file().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }

    fn location(&self) -> String {
        self.state_path.display().to_string()
    }
}
