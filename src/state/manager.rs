//! Versioned, conflict-checked access to the state document.
//!
//! Every write re-reads the persisted document, verifies that its
//! checksum, lineage and serial match what this manager last observed,
//! applies a single mutation, bumps the serial and saves durably before
//! returning. Anything unexpected is reported as [`StateError::Conflict`]
//! and nothing is overwritten.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, StateError};
use crate::resource::ResourceId;

use super::store::StateStore;
use super::types::{HistoryEntry, StateDocument, StateEntry};

#[derive(Debug)]
struct Observed {
    /// Last document read or written by this manager.
    document: StateDocument,
    /// Whether `document` exists in the store.
    persisted: bool,
}

/// Serialized, single-entry access to a state store.
pub struct StateManager {
    store: Arc<dyn StateStore>,
    observed: Mutex<Observed>,
}

impl std::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManager")
            .field("backend", &self.store.backend_type())
            .field("location", &self.store.location())
            .finish_non_exhaustive()
    }
}

impl StateManager {
    /// Opens the state in `store`, starting a new lineage if none exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted document cannot be read or fails
    /// verification.
    pub async fn open(store: Arc<dyn StateStore>, project: &str, environment: &str) -> Result<Self> {
        let observed = match store.load().await? {
            Some(document) => {
                document.verify()?;
                if document.project != project {
                    warn!(
                        "State belongs to project '{}', document declares '{project}'",
                        document.project
                    );
                }
                debug!(
                    "Opened state {} at serial {} ({} resources)",
                    document.lineage,
                    document.serial,
                    document.resources.len()
                );
                Observed {
                    document,
                    persisted: true,
                }
            }
            None => {
                debug!("No state found at {}, starting a new lineage", store.location());
                Observed {
                    document: StateDocument::new(project, environment),
                    persisted: false,
                }
            }
        };

        Ok(Self {
            store,
            observed: Mutex::new(observed),
        })
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Returns a copy of the last observed document.
    pub async fn snapshot(&self) -> StateDocument {
        self.observed.lock().await.document.clone()
    }

    /// Returns the entry for a resource.
    pub async fn get(&self, id: &ResourceId) -> Option<StateEntry> {
        self.observed.lock().await.document.get(id).cloned()
    }

    /// Serial of the last observed document.
    pub async fn serial(&self) -> u64 {
        self.observed.lock().await.document.serial
    }

    /// Lineage of the state.
    pub async fn lineage(&self) -> Uuid {
        self.observed.lock().await.document.lineage
    }

    /// Writes the entry for a resource.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Conflict`] if the persisted state changed
    /// since it was last observed, or a backend error if saving fails.
    pub async fn put(&self, entry: StateEntry) -> Result<()> {
        let id = entry.id.clone();
        self.write(&format!("put {id}"), move |doc| {
            doc.resources.insert(entry.id.clone(), entry);
        })
        .await
    }

    /// Removes the entry for a resource. Removing an absent entry is a no-op
    /// that does not touch the store.
    ///
    /// # Errors
    ///
    /// Same as [`StateManager::put`].
    pub async fn delete(&self, id: &ResourceId) -> Result<()> {
        if self.get(id).await.is_none() {
            return Ok(());
        }
        self.write(&format!("delete {id}"), |doc| {
            doc.resources.remove(id);
        })
        .await
    }

    /// Appends a history entry and records the applied document hash.
    ///
    /// # Errors
    ///
    /// Same as [`StateManager::put`].
    pub async fn record(&self, mut entry: HistoryEntry, config_hash: Option<&str>) -> Result<()> {
        self.write("record history", move |doc| {
            if let Some(hash) = config_hash {
                doc.config_hash = hash.to_string();
            }
            entry.serial = doc.serial + 1;
            entry.timestamp = Utc::now();
            doc.record(entry);
        })
        .await
    }

    /// Re-reads the persisted document, adopting writes committed by other
    /// lock holders since it was last observed.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be read or verified, and
    /// [`StateError::Conflict`] if it belongs to another lineage.
    pub async fn reload(&self) -> Result<()> {
        let mut observed = self.observed.lock().await;
        let Some(document) = self.store.load().await? else {
            return Ok(());
        };
        document.verify()?;

        if observed.persisted && document.lineage != observed.document.lineage {
            return Err(StateError::conflict(format!(
                "lineage changed from {} to {}",
                observed.document.lineage, document.lineage
            ))
            .into());
        }
        if document.serial != observed.document.serial {
            debug!(
                "Reloaded state: serial {} -> {}",
                observed.document.serial, document.serial
            );
        }

        observed.document = document;
        observed.persisted = true;
        Ok(())
    }

    async fn write<F>(&self, what: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut StateDocument),
    {
        let mut observed = self.observed.lock().await;

        let mut document = match (self.store.load().await?, observed.persisted) {
            (Some(current), true) => {
                current.verify()?;
                check_same(&observed.document, &current)?;
                current
            }
            (None, false) => observed.document.clone(),
            (Some(current), false) => {
                return Err(StateError::conflict(format!(
                    "state was created elsewhere (lineage {}, serial {})",
                    current.lineage, current.serial
                ))
                .into());
            }
            (None, true) => {
                return Err(StateError::conflict(format!(
                    "state at {} disappeared after serial {}",
                    self.store.location(),
                    observed.document.serial
                ))
                .into());
            }
        };

        mutate(&mut document);
        document.serial += 1;
        document.seal();

        self.store.save(&document).await?;
        debug!("State {what} -> serial {}", document.serial);

        observed.document = document;
        observed.persisted = true;
        Ok(())
    }
}

/// Checks that the persisted document is the one last observed.
fn check_same(expected: &StateDocument, current: &StateDocument) -> std::result::Result<(), StateError> {
    if current.lineage != expected.lineage {
        return Err(StateError::conflict(format!(
            "lineage changed from {} to {}",
            expected.lineage, current.lineage
        )));
    }
    if current.serial != expected.serial {
        return Err(StateError::conflict(format!(
            "serial changed from {} to {} by another writer",
            expected.serial, current.serial
        )));
    }
    if current.checksum != expected.checksum {
        return Err(StateError::conflict(format!(
            "content changed at serial {}",
            current.serial
        )));
    }
    Ok(())
}
