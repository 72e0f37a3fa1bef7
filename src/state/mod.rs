//! State management module for the Cairn reconciler.
//!
//! This module provides persistent, versioned storage of the last-known
//! attributes of every managed resource, an advisory lock, and the apply
//! history.

mod local;
mod lock;
mod manager;
mod memory;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
pub use manager::StateManager;
pub use memory::MemoryStateStore;
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{
    HistoryEntry, HistoryOperation, HistorySummary, MAX_HISTORY, STATE_FORMAT_VERSION,
    StateDocument, StateEntry,
};

use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::config::{StateBackend, StateConfig};
use crate::error::{ConfigError, Result};

/// Creates the store configured for a project.
///
/// Relative local paths are resolved against `base_dir`, normally the
/// directory holding the document.
///
/// # Errors
///
/// Returns an error if the S3 backend lacks a bucket or cannot be set up.
pub async fn create_store(config: &StateConfig, base_dir: &Path) -> Result<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match config.backend {
        StateBackend::Local => {
            let store = match &config.path {
                Some(path) => LocalStateStore::with_state_path(base_dir.join(path)),
                None => LocalStateStore::with_base_dir(base_dir.join(STATE_DIR)),
            };
            Arc::new(store)
        }
        StateBackend::S3 => {
            let bucket = config.bucket.as_deref().ok_or_else(|| {
                ConfigError::validation("S3 state backend requires a bucket", "state.bucket")
            })?;
            Arc::new(S3StateStore::new(bucket, config.prefix.as_deref(), config.region.as_deref()).await?)
        }
    };

    debug!("Using {} state at {}", store.backend_type(), store.location());
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_local_store() {
        let dir = TempDir::new().unwrap();

        let store = create_store(&StateConfig::default(), dir.path()).await.unwrap();
        assert_eq!(store.backend_type(), "local");
        assert!(store.location().ends_with("state.json"));

        let config = StateConfig {
            path: Some(String::from("custom/site.json")),
            ..StateConfig::default()
        };
        let store = create_store(&config, dir.path()).await.unwrap();
        assert!(store.location().ends_with("site.json"));
    }

    #[tokio::test]
    async fn test_s3_requires_bucket() {
        let config = StateConfig {
            backend: StateBackend::S3,
            ..StateConfig::default()
        };
        assert!(create_store(&config, Path::new(".")).await.is_err());
    }
}
