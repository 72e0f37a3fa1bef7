//! Document hashing for change detection.
//!
//! Hashes are computed over canonical JSON (sorted maps), so the same
//! document always yields the same fingerprint regardless of key order in
//! the YAML source.

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::spec::InfraConfig;
use super::variables::VariableValues;

/// Hasher for computing document and attribute fingerprints.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the document together with the resolved variables.
    ///
    /// The state section is excluded: moving state between backends does
    /// not change the desired infrastructure.
    #[must_use]
    pub fn hash_config(&self, config: &InfraConfig, variables: &VariableValues) -> String {
        let mut hasher = Sha256::new();

        hasher.update(config.project.name.as_bytes());
        hasher.update(config.project.environment.as_bytes());
        hasher.update(canonical_bytes(variables));

        // Resource order in the document is not significant
        let mut resources: Vec<_> = config.resources.iter().collect();
        resources.sort_by_key(|r| r.id());
        for resource in resources {
            hasher.update(canonical_bytes(resource));
        }

        hasher.update(canonical_bytes(&config.outputs));

        hex::encode(hasher.finalize())
    }

    /// Computes a hash of any serializable value.
    #[must_use]
    pub fn hash_value<T: Serialize>(&self, value: &T) -> String {
        let mut hasher = Sha256::new();
        hasher.update(canonical_bytes(value));
        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes in constant time.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

/// Serializes a value to canonical JSON bytes.
///
/// Every map in the document model is a `BTreeMap`, so key order is stable.
fn canonical_bytes<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use serde_json::json;

    const DOC: &str = r"
project:
  name: site
resources:
  - type: bucket
    name: content
    attributes:
      bucket_name: a
  - type: certificate
    name: site
    attributes:
      domain_name: example.com
";

    #[test]
    fn test_config_hash_deterministic() {
        let config = ConfigParser::new().parse_yaml(DOC, None).unwrap();
        let hasher = ConfigHasher::new();
        let vars = VariableValues::new();

        assert_eq!(hasher.hash_config(&config, &vars), hasher.hash_config(&config, &vars));
    }

    #[test]
    fn test_resource_order_not_significant() {
        let config = ConfigParser::new().parse_yaml(DOC, None).unwrap();
        let mut reordered = config.clone();
        reordered.resources.reverse();

        let hasher = ConfigHasher::new();
        let vars = VariableValues::new();
        assert_eq!(hasher.hash_config(&config, &vars), hasher.hash_config(&reordered, &vars));
    }

    #[test]
    fn test_variables_change_hash() {
        let config = ConfigParser::new().parse_yaml(DOC, None).unwrap();
        let hasher = ConfigHasher::new();

        let mut vars = VariableValues::new();
        let before = hasher.hash_config(&config, &vars);
        vars.insert(String::from("domain"), json!("example.org"));
        assert_ne!(before, hasher.hash_config(&config, &vars));
    }

    #[test]
    fn test_short_hash() {
        let hasher = ConfigHasher::new();
        assert_eq!(hasher.short_hash("abcdef1234567890"), "abcdef12");
    }

    #[test]
    fn test_hashes_match() {
        assert!(ConfigHasher::hashes_match("abc123", "abc123"));
        assert!(!ConfigHasher::hashes_match("abc123", "abc124"));
        assert!(!ConfigHasher::hashes_match("abc123", "abc12"));
    }
}
