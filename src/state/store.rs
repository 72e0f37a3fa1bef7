//! State store trait definition.
//!
//! A store persists one [`StateDocument`] and an advisory lock. It knows
//! nothing about serials or checksums; those are enforced by
//! [`StateManager`](super::StateManager).

use async_trait::async_trait;

use crate::error::Result;
use super::types::StateDocument;
use super::lock::LockInfo;

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the state document.
    ///
    /// Returns `None` if no state exists yet.
    async fn load(&self) -> Result<Option<StateDocument>>;

    /// Saves the state document durably before returning.
    async fn save(&self, state: &StateDocument) -> Result<()>;

    /// Deletes the state document and any lock.
    async fn delete(&self) -> Result<()>;

    /// Checks if state exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires the lock on behalf of `holder` for `operation`.
    ///
    /// Fails with `LockedByOther` if an unexpired lock is held.
    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo>;

    /// Releases the lock if `lock_id` matches the current one.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Removes any lock regardless of holder.
    async fn force_unlock(&self) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked.
    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .get_lock_info()
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;

    /// Human-readable location of the state.
    fn location(&self) -> String;
}
