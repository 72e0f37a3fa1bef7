//! Document validation.
//!
//! Checks naming, backend settings, engine tuning and resource declarations
//! before any graph is built. Reference resolution and cycle detection are
//! the graph builder's job, not the validator's.

use crate::error::{CairnError, ConfigError, Result};
use crate::resource::ResourceId;
use std::collections::HashSet;
use tracing::debug;

use super::spec::{EngineConfig, InfraConfig, ProjectConfig, ResourceConfig, StateBackend, StateConfig};

/// Validator for infrastructure documents.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a document.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any were found.
    pub fn validate(&self, config: &InfraConfig) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_engine(&config.engine, &mut result);
        Self::validate_variables(config, &mut result);
        Self::validate_resources(&config.resources, &mut result);
        Self::validate_outputs(config, &mut result);

        if result.errors.is_empty() {
            debug!("Configuration validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(CairnError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    /// Validates project configuration.
    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_project_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if project.environment.is_empty() {
            result.error("project.environment", "Environment cannot be empty");
        }
    }

    /// Validates state configuration.
    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_deref().is_none_or(str::is_empty) {
                    result.error("state.bucket", "S3 bucket name is required when using S3 backend");
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket is ignored by the local backend"));
                }
            }
        }
    }

    /// Validates engine tuning.
    fn validate_engine(engine: &EngineConfig, result: &mut ValidationResult) {
        if engine.concurrency == 0 {
            result.error("engine.concurrency", "Concurrency must be at least 1");
        }

        if engine.retry.max_attempts == 0 {
            result.error("engine.retry.max_attempts", "At least one attempt is required");
        }

        if engine.retry.multiplier < 1.0 {
            result.error("engine.retry.multiplier", "Backoff multiplier must be >= 1.0");
        }

        if engine.retry.initial_backoff_ms > engine.retry.max_backoff_ms {
            result.error(
                "engine.retry.initial_backoff_ms",
                "Initial backoff cannot exceed max_backoff_ms",
            );
        }
    }

    /// Validates variable names.
    fn validate_variables(config: &InfraConfig, result: &mut ValidationResult) {
        for name in config.variables.keys() {
            if !is_valid_identifier(name) {
                result.error(
                    format!("variables.{name}"),
                    format!("Variable name '{name}' is invalid. Use letters, digits and underscores."),
                );
            }
        }
    }

    /// Validates resource declarations.
    fn validate_resources(resources: &[ResourceConfig], result: &mut ValidationResult) {
        if resources.is_empty() {
            result.warnings.push(String::from("No resources defined in configuration"));
            return;
        }

        let mut seen = HashSet::new();

        for (i, resource) in resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");
            let id = resource.id();

            if !seen.insert(id.clone()) {
                result.error(format!("{prefix}.name"), format!("Duplicate resource: {id}"));
            }

            if !is_valid_identifier(&resource.name) {
                result.error(
                    format!("{prefix}.name"),
                    format!(
                        "Resource name '{}' is invalid. Use letters, digits, underscores and hyphens.",
                        resource.name
                    ),
                );
            }

            for (j, hint) in resource.depends_on.iter().enumerate() {
                match ResourceId::parse(hint) {
                    Ok(target) if target == id => result.error(
                        format!("{prefix}.depends_on[{j}]"),
                        format!("{id} cannot depend on itself"),
                    ),
                    Ok(_) => {}
                    Err(e) => result.error(format!("{prefix}.depends_on[{j}]"), e),
                }
            }

            match &resource.enabled {
                None | Some(serde_json::Value::Bool(_) | serde_json::Value::String(_)) => {}
                Some(other) => result.error(
                    format!("{prefix}.enabled"),
                    format!("enabled must be a boolean or a variable expression, got {other}"),
                ),
            }

            if resource.lifecycle.ignore_changes.iter().any(String::is_empty) {
                result.error(
                    format!("{prefix}.lifecycle.ignore_changes"),
                    "ignore_changes entries cannot be empty",
                );
            }

            if resource.lifecycle.prevent_destroy && resource.lifecycle.create_before_destroy {
                result.warnings.push(format!(
                    "{prefix}: create_before_destroy has no effect while prevent_destroy is set"
                ));
            }
        }
    }

    /// Validates output names.
    fn validate_outputs(config: &InfraConfig, result: &mut ValidationResult) {
        for name in config.outputs.keys() {
            if !is_valid_identifier(name) {
                result.error(format!("outputs.{name}"), format!("Output name '{name}' is invalid"));
            }
        }
    }
}

/// Validates that a project name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_project_name(name: &str) -> bool {
    let mut chars = name.chars();

    if !chars.next().is_some_and(|c| c.is_ascii_lowercase()) {
        return false;
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

/// Resource, variable and output names: a letter followed by letters,
/// digits, underscores or hyphens. Dots are reserved for references.
fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();

    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl ValidationResult {
    /// Records an error.
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
