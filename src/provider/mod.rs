//! Provider interface.
//!
//! A provider performs {Read, Create, Update, Delete} for one resource kind
//! and publishes a [`ResourceSchema`] describing which attributes force a
//! replacement and which are computed by the remote side. The engine never
//! looks at attribute meaning beyond that metadata.

mod registry;
mod retry;
mod sandbox;

pub use registry::ProviderRegistry;
pub use retry::{Attempted, RetryPolicy};
pub use sandbox::{Fault, SandboxProvider, SandboxRemote};

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

use crate::error::ProviderError;
use crate::resource::{Attributes, ResourceId, ResourceKind};

/// Result type for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// A provider operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Read the current remote attributes.
    Read,
    /// Create a new instance.
    Create,
    /// Update an instance in place.
    Update,
    /// Delete an instance.
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Read => "read",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Attribute metadata published by a provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceSchema {
    /// Attributes whose change requires a new instance.
    pub force_new: BTreeSet<String>,
    /// Attributes assigned by the remote side.
    pub computed: BTreeSet<String>,
}

impl ResourceSchema {
    /// Creates an empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds attributes that force replacement.
    #[must_use]
    pub fn force_new<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.force_new.extend(attributes.into_iter().map(Into::into));
        self
    }

    /// Adds remote-computed attributes.
    #[must_use]
    pub fn computed<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.computed.extend(attributes.into_iter().map(Into::into));
        self
    }

    /// Returns true if changing the attribute requires replacement.
    #[must_use]
    pub fn forces_replacement(&self, attribute: &str) -> bool {
        self.force_new.contains(attribute)
    }

    /// Returns true if the attribute is computed by the remote side.
    #[must_use]
    pub fn is_computed(&self, attribute: &str) -> bool {
        self.computed.contains(attribute)
    }
}

/// A newly created remote instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Created {
    /// Identifier assigned by the remote side.
    pub external_id: String,
    /// Actual attributes after creation, including computed ones.
    pub attributes: Attributes,
}

/// Uniform lifecycle operations for one resource kind.
///
/// Operations take desired attributes and return actual attributes. Errors
/// are classified as transient (worth retrying) or permanent.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Resource kind handled by this provider.
    fn kind(&self) -> ResourceKind;

    /// Attribute metadata.
    fn schema(&self) -> &ResourceSchema;

    /// Reads the remote attributes; `None` when the instance no longer exists.
    async fn read(&self, external_id: &str) -> ProviderResult<Option<Attributes>>;

    /// Creates a new instance.
    async fn create(&self, id: &ResourceId, desired: &Attributes) -> ProviderResult<Created>;

    /// Updates an existing instance in place.
    async fn update(&self, external_id: &str, desired: &Attributes) -> ProviderResult<Attributes>;

    /// Deletes an instance. Deleting an absent instance succeeds.
    async fn delete(&self, external_id: &str) -> ProviderResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_builder() {
        let schema = ResourceSchema::new()
            .force_new(["domain_name"])
            .computed(["arn", "status"]);

        assert!(schema.forces_replacement("domain_name"));
        assert!(!schema.forces_replacement("arn"));
        assert!(schema.is_computed("status"));
        assert!(!schema.is_computed("domain_name"));
    }

    #[test]
    fn test_operation_display() {
        assert_eq!(Operation::Create.to_string(), "create");
        assert_eq!(Operation::Delete.to_string(), "delete");
    }
}
