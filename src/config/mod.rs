//! Configuration module for the Cairn reconciler.
//!
//! This module handles all document-related functionality:
//! - Parsing and deserializing `cairn.yaml`
//! - Resolving input variables
//! - Validation of document values
//! - Computing document hashes for change detection

mod hash;
mod parser;
mod spec;
mod validator;
mod variables;

pub use hash::ConfigHasher;
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use spec::{
    EngineConfig, InfraConfig, LifecycleConfig, OutputConfig, ProjectConfig, ProviderConfig,
    ResourceConfig, RetryConfig, StateBackend, StateConfig, VariableConfig,
};
pub use validator::{ConfigValidator, ValidationResult};
pub use variables::{VAR_ENV_PREFIX, VariableResolver, VariableValues};
