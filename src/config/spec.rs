//! Document types for the reconciler.
//!
//! These structs map to `cairn.yaml`. The document is declarative: it
//! describes the desired end state of every resource and nothing about how
//! to get there.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::resource::{ResourceId, ResourceKind};

/// The root document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InfraConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Engine tuning (concurrency, retries).
    #[serde(default)]
    pub engine: EngineConfig,
    /// Sandbox provider configuration.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Input variables.
    #[serde(default)]
    pub variables: BTreeMap<String, VariableConfig>,
    /// Resource declarations.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    /// Named values exported after apply.
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputConfig>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state file path (for local backend). Defaults to `.cairn/state.json`.
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Maximum number of provider calls in flight.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Whether to refresh state from providers before planning.
    #[serde(default = "default_refresh")]
    pub refresh: bool,
    /// Retry policy for transient provider errors.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Retry policy for transient provider errors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound for a single delay, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive delays.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

/// Sandbox provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ProviderConfig {
    /// File holding the simulated remote objects. Defaults to
    /// `<state dir>/remote.json`.
    #[serde(default)]
    pub remote_path: Option<String>,
}

/// An input variable declaration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct VariableConfig {
    /// Value used when nothing else is supplied.
    #[serde(default)]
    pub default: Option<Value>,
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
}

/// A single resource declaration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceConfig {
    /// Resource kind.
    #[serde(rename = "type")]
    pub kind: ResourceKind,
    /// Name, unique per kind.
    pub name: String,
    /// Desired attributes; strings may contain `${...}` expressions.
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    /// Explicit dependency hints (`kind.name`).
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Build-time predicate: a boolean or a `${var.x}` expression.
    #[serde(default)]
    pub enabled: Option<Value>,
    /// Lifecycle policy flags.
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

/// Lifecycle policy flags for a resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LifecycleConfig {
    /// Create the replacement before deleting the old instance.
    #[serde(default)]
    pub create_before_destroy: bool,
    /// Refuse any plan that deletes or replaces this resource.
    #[serde(default)]
    pub prevent_destroy: bool,
    /// Attributes excluded from diffing.
    #[serde(default)]
    pub ignore_changes: Vec<String>,
}

/// A named output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    /// Output expression.
    pub value: Value,
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
}

// Default value functions

const fn default_concurrency() -> usize {
    4
}

const fn default_refresh() -> bool {
    true
}

const fn default_max_attempts() -> u32 {
    4
}

const fn default_initial_backoff_ms() -> u64 {
    250
}

const fn default_max_backoff_ms() -> u64 {
    10_000
}

const fn default_multiplier() -> f64 {
    2.0
}

fn default_environment() -> String {
    String::from("dev")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            refresh: default_refresh(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl InfraConfig {
    /// Returns the fully qualified project name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Returns the identifiers of all declared resources, enabled or not.
    #[must_use]
    pub fn resource_ids(&self) -> Vec<ResourceId> {
        self.resources.iter().map(ResourceConfig::id).collect()
    }
}

impl ResourceConfig {
    /// Returns the resource identifier.
    #[must_use]
    pub fn id(&self) -> ResourceId {
        ResourceId::new(self.kind, &self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_defaults() {
        let yaml = r"
type: bucket
name: site
";
        let resource: ResourceConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(resource.id().to_string(), "bucket.site");
        assert!(resource.attributes.is_empty());
        assert!(resource.enabled.is_none());
        assert!(!resource.lifecycle.create_before_destroy);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let yaml = r"
type: volume
name: data
";
        assert!(serde_yaml::from_str::<ResourceConfig>(yaml).is_err());
    }

    #[test]
    fn test_engine_defaults() {
        let engine = EngineConfig::default();
        assert_eq!(engine.concurrency, 4);
        assert!(engine.refresh);
        assert_eq!(engine.retry.max_attempts, 4);
    }
}
