//! In-memory state backend for tests and embedding.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{CairnError, Result, StateError};

use super::lock::{LockInfo, holder_or_generated};
use super::store::StateStore;
use super::types::StateDocument;

/// State store that keeps the document in process memory.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    document: Mutex<Option<StateDocument>>,
    lock: Mutex<Option<LockInfo>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store already holding `document`.
    #[must_use]
    pub fn with_document(document: StateDocument) -> Self {
        Self {
            document: Mutex::new(Some(document)),
            lock: Mutex::new(None),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<Option<StateDocument>> {
        Ok(self.document.lock().await.clone())
    }

    async fn save(&self, state: &StateDocument) -> Result<()> {
        debug!("Saving state serial {} in memory", state.serial);
        *self.document.lock().await = Some(state.clone());
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        *self.document.lock().await = None;
        *self.lock.lock().await = None;
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.document.lock().await.is_some())
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        let mut lock = self.lock.lock().await;

        if let Some(existing) = lock.as_ref()
            && !existing.is_expired()
        {
            return Err(CairnError::State(StateError::LockedByOther {
                holder: existing.holder.clone(),
                since: existing.acquired_at.to_rfc3339(),
            }));
        }

        let info = LockInfo::new(&holder_or_generated(holder), operation);
        *lock = Some(info.clone());
        Ok(info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let mut lock = self.lock.lock().await;
        if lock.as_ref().is_some_and(|l| l.lock_id == lock_id) {
            *lock = None;
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        *self.lock.lock().await = None;
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.lock.lock().await.clone())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }

    fn location(&self) -> String {
        String::from("memory")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip_and_lock() {
        let store = MemoryStateStore::new();
        assert!(store.load().await.unwrap().is_none());

        let doc = StateDocument::new("site", "dev");
        store.save(&doc).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(doc));

        let lock = store.acquire_lock("a", "apply").await.unwrap();
        assert!(store.acquire_lock("b", "apply").await.is_err());
        store.release_lock(&lock.lock_id).await.unwrap();
        assert!(!store.is_locked().await.unwrap());
    }
}
