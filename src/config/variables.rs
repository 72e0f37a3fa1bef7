//! Variable resolution.
//!
//! Values are taken, in increasing precedence, from the declared default,
//! the `CAIRN_VAR_<NAME>` environment variable, and `--var NAME=VALUE`
//! assignments on the command line.

use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{CairnError, ConfigError, Result};

use super::spec::VariableConfig;

/// Prefix of environment variables that set document variables.
pub const VAR_ENV_PREFIX: &str = "CAIRN_VAR_";

/// Resolved variable values, keyed by name.
pub type VariableValues = BTreeMap<String, Value>;

/// Resolves declared variables to concrete values.
#[derive(Debug, Default)]
pub struct VariableResolver {
    /// Command-line assignments.
    overrides: BTreeMap<String, String>,
    /// Whether to consult the process environment.
    use_env: bool,
}

impl VariableResolver {
    /// Creates a resolver that consults the process environment.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            overrides: BTreeMap::new(),
            use_env: true,
        }
    }

    /// Disables environment lookups (used by tests and library callers).
    #[must_use]
    pub const fn without_env(mut self) -> Self {
        self.use_env = false;
        self
    }

    /// Adds `NAME=VALUE` assignments.
    ///
    /// # Errors
    ///
    /// Returns an error if an assignment has no `=` or an empty name.
    pub fn with_assignments<I, S>(mut self, assignments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for raw in assignments {
            let raw = raw.as_ref();
            let (name, value) = raw
                .split_once('=')
                .filter(|(name, _)| !name.trim().is_empty())
                .ok_or_else(|| {
                    CairnError::Config(ConfigError::InvalidVariableAssignment {
                        spec: raw.to_string(),
                    })
                })?;
            self.overrides
                .insert(name.trim().to_string(), value.to_string());
        }
        Ok(self)
    }

    /// Resolves every declared variable.
    ///
    /// Assignments for undeclared variables are ignored with a debug log.
    ///
    /// # Errors
    ///
    /// Returns an error if a declared variable ends up without a value.
    pub fn resolve(&self, declared: &BTreeMap<String, VariableConfig>) -> Result<VariableValues> {
        let mut values = VariableValues::new();

        for (name, decl) in declared {
            let raw = self.overrides.get(name).cloned().or_else(|| {
                if self.use_env {
                    std::env::var(format!("{VAR_ENV_PREFIX}{name}")).ok()
                } else {
                    None
                }
            });

            let value = match (raw, &decl.default) {
                (Some(raw), default) => coerce(&raw, default.as_ref()),
                (None, Some(default)) => default.clone(),
                (None, None) => {
                    return Err(CairnError::Config(ConfigError::MissingVariable {
                        name: name.clone(),
                    }));
                }
            };

            values.insert(name.clone(), value);
        }

        for name in self.overrides.keys() {
            if !declared.contains_key(name) {
                debug!("Ignoring assignment for undeclared variable '{name}'");
            }
        }

        Ok(values)
    }
}

/// Converts a raw string to the JSON type of the declared default.
fn coerce(raw: &str, default: Option<&Value>) -> Value {
    match default {
        Some(Value::Bool(_)) => raw
            .parse::<bool>()
            .map_or_else(|_| Value::String(raw.to_string()), Value::Bool),
        Some(Value::Number(_)) => serde_json::from_str::<serde_json::Number>(raw)
            .map_or_else(|_| Value::String(raw.to_string()), Value::Number),
        Some(Value::Array(_) | Value::Object(_)) => {
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
        }
        _ => Value::String(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn declared() -> BTreeMap<String, VariableConfig> {
        let mut vars = BTreeMap::new();
        vars.insert(
            String::from("domain"),
            VariableConfig {
                default: Some(json!("example.com")),
                description: None,
            },
        );
        vars.insert(
            String::from("enable_www"),
            VariableConfig {
                default: Some(json!(false)),
                description: None,
            },
        );
        vars
    }

    #[test]
    fn test_defaults_used() {
        let values = VariableResolver::new().without_env().resolve(&declared()).unwrap();
        assert_eq!(values["domain"], json!("example.com"));
        assert_eq!(values["enable_www"], json!(false));
    }

    #[test]
    fn test_assignment_overrides_and_coerces() {
        let values = VariableResolver::new()
            .without_env()
            .with_assignments(["enable_www=true", "domain=cairn.dev"])
            .unwrap()
            .resolve(&declared())
            .unwrap();

        assert_eq!(values["enable_www"], json!(true));
        assert_eq!(values["domain"], json!("cairn.dev"));
    }

    #[test]
    fn test_missing_value_is_error() {
        let mut vars = declared();
        vars.insert(String::from("zone_id"), VariableConfig::default());

        let result = VariableResolver::new().without_env().resolve(&vars);
        assert!(matches!(
            result,
            Err(CairnError::Config(ConfigError::MissingVariable { ref name })) if name == "zone_id"
        ));
    }

    #[test]
    fn test_invalid_assignment() {
        assert!(VariableResolver::new().with_assignments(["novalue"]).is_err());
        assert!(VariableResolver::new().with_assignments(["=x"]).is_err());
    }
}
