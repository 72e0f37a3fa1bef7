//! Persisted state types.
//!
//! The state document maps resource ids to their last-applied attributes.
//! It is versioned by a lineage (fixed for the document's lifetime) and a
//! serial (incremented on every write), and carries a checksum over its
//! resources so that tampering or partial writes are detected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::error::StateError;
use crate::graph::Lifecycle;
use crate::resource::{Attributes, ResourceId};

/// Current version of the state format.
pub const STATE_FORMAT_VERSION: u32 = 1;

/// Number of history entries retained.
pub const MAX_HISTORY: usize = 100;

/// The persisted state document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    /// State format version.
    pub format_version: u32,
    /// Identity of this state's lineage.
    pub lineage: Uuid,
    /// Monotonic write counter.
    pub serial: u64,
    /// SHA-256 over the canonical resource map.
    pub checksum: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Hash of the last applied document.
    #[serde(default)]
    pub config_hash: String,
    /// When the state was last written.
    pub last_updated: DateTime<Utc>,
    /// Last-known resources.
    #[serde(default)]
    pub resources: BTreeMap<ResourceId, StateEntry>,
    /// Recent apply summaries, oldest first.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// Last-known state of a single resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    /// Resource id.
    pub id: ResourceId,
    /// Identifier assigned by the provider.
    pub external_id: String,
    /// Attributes returned by the last successful provider call.
    pub attributes: Attributes,
    /// Dependencies at apply time; orders deletes of orphans.
    #[serde(default)]
    pub dependencies: BTreeSet<ResourceId>,
    /// Lifecycle flags at apply time.
    #[serde(default)]
    pub lifecycle: Lifecycle,
    /// When the instance was created.
    pub created_at: DateTime<Utc>,
    /// When the entry was last written.
    pub updated_at: DateTime<Utc>,
}

/// A single entry in the apply history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the cycle finished.
    pub timestamp: DateTime<Utc>,
    /// What kind of cycle ran.
    pub operation: HistoryOperation,
    /// Hash of the document applied.
    pub config_hash: String,
    /// Serial after the cycle.
    pub serial: u64,
    /// Per-outcome counts.
    pub summary: HistorySummary,
    /// Whether every node reached `Applied`.
    pub success: bool,
    /// First error message, if any.
    #[serde(default)]
    pub error: Option<String>,
}

/// Counts recorded in a history entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistorySummary {
    /// Resources created.
    pub created: usize,
    /// Resources updated in place.
    pub updated: usize,
    /// Resources replaced.
    pub replaced: usize,
    /// Resources deleted.
    pub deleted: usize,
    /// Nodes that failed.
    pub failed: usize,
    /// Nodes that were blocked.
    pub blocked: usize,
}

/// Types of recorded cycles.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOperation {
    /// Plan and apply.
    Apply,
    /// Teardown.
    Destroy,
    /// State refreshed from providers.
    Refresh,
}

impl StateDocument {
    /// Creates a new empty document with a fresh lineage.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        let mut document = Self {
            format_version: STATE_FORMAT_VERSION,
            lineage: Uuid::new_v4(),
            serial: 0,
            checksum: String::new(),
            project: project.to_string(),
            environment: environment.to_string(),
            config_hash: String::new(),
            last_updated: Utc::now(),
            resources: BTreeMap::new(),
            history: Vec::new(),
        };
        document.checksum = document.compute_checksum();
        document
    }

    /// Computes the checksum of the resource map.
    #[must_use]
    pub fn compute_checksum(&self) -> String {
        // BTreeMap keys and serde_json's sorted objects keep this canonical
        let canonical = serde_json::to_vec(&self.resources).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }

    /// Refreshes the checksum and timestamp after a mutation.
    pub fn seal(&mut self) {
        self.checksum = self.compute_checksum();
        self.last_updated = Utc::now();
    }

    /// Verifies the format version and checksum.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::VersionMismatch`] for documents written by a
    /// newer format, or [`StateError::Conflict`] if the checksum does not
    /// match the content.
    pub fn verify(&self) -> Result<(), StateError> {
        if self.format_version > STATE_FORMAT_VERSION {
            return Err(StateError::VersionMismatch {
                expected: STATE_FORMAT_VERSION,
                found: self.format_version,
            });
        }

        let actual = self.compute_checksum();
        if actual != self.checksum {
            return Err(StateError::conflict(format!(
                "checksum mismatch at serial {} (recorded {}, computed {})",
                self.serial,
                short(&self.checksum),
                short(&actual)
            )));
        }

        Ok(())
    }

    /// Gets a resource entry.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&StateEntry> {
        self.resources.get(id)
    }

    /// Returns true if the document tracks no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Appends a history entry, keeping the most recent [`MAX_HISTORY`].
    pub fn record(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
        if self.history.len() > MAX_HISTORY {
            let excess = self.history.len() - MAX_HISTORY;
            self.history.drain(..excess);
        }
    }
}

impl StateEntry {
    /// Creates an entry for a freshly created instance.
    #[must_use]
    pub fn new(id: ResourceId, external_id: impl Into<String>, attributes: Attributes) -> Self {
        let now = Utc::now();
        Self {
            id,
            external_id: external_id.into(),
            attributes,
            dependencies: BTreeSet::new(),
            lifecycle: Lifecycle::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the recorded dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: BTreeSet<ResourceId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Sets the recorded lifecycle flags.
    #[must_use]
    pub fn with_lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }
}

fn short(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}
