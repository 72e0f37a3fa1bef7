//! Resource nodes of the desired graph.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::config::LifecycleConfig;
use crate::resource::{Attributes, ResourceId};

use super::expr::{Expr, Reference};

/// Lifecycle policy flags of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
    /// Create the replacement before deleting the old instance.
    pub create_before_destroy: bool,
    /// Refuse plans that delete or replace the node.
    pub prevent_destroy: bool,
    /// Attributes excluded from diffing.
    pub ignore_changes: BTreeSet<String>,
}

impl From<&LifecycleConfig> for Lifecycle {
    fn from(config: &LifecycleConfig) -> Self {
        Self {
            create_before_destroy: config.create_before_destroy,
            prevent_destroy: config.prevent_destroy,
            ignore_changes: config.ignore_changes.iter().cloned().collect(),
        }
    }
}

/// A resource in the desired graph. Immutable once the graph is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNode {
    /// Identifier.
    pub id: ResourceId,
    /// Desired attributes.
    pub attributes: BTreeMap<String, Expr>,
    /// Resources this node depends on (outgoing edges).
    pub dependencies: BTreeSet<ResourceId>,
    /// Lifecycle policy.
    pub lifecycle: Lifecycle,
}

impl ResourceNode {
    /// Returns every reference made by the node's attributes.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        self.attributes.values().flat_map(Expr::references).collect()
    }

    /// Resolves all attributes against known values of other resources.
    ///
    /// # Errors
    ///
    /// Returns the first reference that cannot be resolved.
    pub fn resolve_attributes(
        &self,
        known: &BTreeMap<ResourceId, Attributes>,
    ) -> Result<Attributes, Reference> {
        self.attributes
            .iter()
            .map(|(name, expr)| Ok((name.clone(), expr.resolve_from(known)?)))
            .collect()
    }

    /// Returns true if changes to the attribute are ignored.
    #[must_use]
    pub fn ignores(&self, attribute: &str) -> bool {
        self.lifecycle.ignore_changes.contains(attribute)
    }
}
