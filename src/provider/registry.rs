//! Provider lookup by resource kind.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::ProviderError;
use crate::resource::ResourceKind;

use super::{Provider, ResourceSchema, SandboxProvider, SandboxRemote};

/// Maps resource kinds to providers.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<ResourceKind, Arc<dyn Provider>>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("kinds", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers sandbox providers for every kind, sharing one remote.
    #[must_use]
    pub fn sandbox(remote: &SandboxRemote) -> Self {
        let mut registry = Self::new();
        for kind in ResourceKind::ALL {
            registry.register(Arc::new(SandboxProvider::new(kind, remote.clone())));
        }
        registry
    }

    /// Registers a provider, replacing any previous one for its kind.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.kind(), provider);
    }

    /// Returns the provider for a kind.
    ///
    /// # Errors
    ///
    /// A missing provider is a permanent error for the node being handled.
    pub fn get(&self, kind: ResourceKind) -> Result<Arc<dyn Provider>, ProviderError> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| ProviderError::permanent(format!("no provider registered for '{kind}'")))
    }

    /// Returns the schema for a kind, if a provider is registered.
    #[must_use]
    pub fn schema(&self, kind: ResourceKind) -> Option<&ResourceSchema> {
        self.providers.get(&kind).map(|p| p.schema())
    }

    /// Returns true if a provider handles the kind.
    #[must_use]
    pub fn contains(&self, kind: ResourceKind) -> bool {
        self.providers.contains_key(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockProvider;

    #[test]
    fn test_missing_provider_is_permanent() {
        let registry = ProviderRegistry::new();
        let err = registry.get(ResourceKind::Bucket).err().unwrap();
        assert!(!err.is_transient());
        assert!(err.message().contains("bucket"));
    }

    #[test]
    fn test_register_mock() {
        let mut mock = MockProvider::new();
        mock.expect_kind().return_const(ResourceKind::DnsRecord);
        mock.expect_schema()
            .return_const(ResourceSchema::new().force_new(["name"]));

        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(mock));

        assert!(registry.contains(ResourceKind::DnsRecord));
        assert!(!registry.contains(ResourceKind::Bucket));
        assert!(
            registry
                .schema(ResourceKind::DnsRecord)
                .is_some_and(|s| s.forces_replacement("name"))
        );
    }

    #[test]
    fn test_sandbox_registry_covers_all_kinds() {
        let registry = ProviderRegistry::sandbox(&SandboxRemote::in_memory());
        for kind in ResourceKind::ALL {
            assert!(registry.contains(kind));
        }
        assert!(
            registry
                .schema(ResourceKind::Certificate)
                .is_some_and(|s| s.forces_replacement("domain_name"))
        );
    }
}
