//! Document parser for loading configuration files.
//!
//! This module handles loading the document from YAML and applying
//! environment variable overrides, with proper precedence and error handling.

use crate::error::{CairnError, ConfigError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::InfraConfig;

/// Parser for loading the infrastructure document.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads the document from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<InfraConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(CairnError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            CairnError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses the document from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<InfraConfig> {
        debug!("Parsing YAML configuration");

        let config: InfraConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            CairnError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed configuration for project {} ({} resources)",
            config.project.name,
            config.resources.len()
        );
        Ok(config)
    }

    /// Loads the document with environment variable overrides.
    ///
    /// Environment variables are checked in the format
    /// `CAIRN_<SECTION>_<KEY>` (e.g., `CAIRN_PROJECT_NAME`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<InfraConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config)?;
        Ok(config)
    }

    /// Applies environment variable overrides to the document.
    fn apply_env_overrides(config: &mut InfraConfig) -> Result<()> {
        if let Ok(name) = std::env::var("CAIRN_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            config.project.name = name;
        }

        if let Ok(env) = std::env::var("CAIRN_PROJECT_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            config.project.environment = env;
        }

        if let Ok(bucket) = std::env::var("CAIRN_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            config.state.bucket = Some(bucket);
        }

        if let Ok(prefix) = std::env::var("CAIRN_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            config.state.prefix = Some(prefix);
        }

        if let Ok(concurrency) = std::env::var("CAIRN_ENGINE_CONCURRENCY") {
            debug!("Overriding engine.concurrency from environment");
            config.engine.concurrency = concurrency.parse().map_err(|_| {
                CairnError::Config(ConfigError::validation(
                    format!("CAIRN_ENGINE_CONCURRENCY must be a positive integer, got '{concurrency}'"),
                    "engine.concurrency",
                ))
            })?;
        }

        Ok(())
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                CairnError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Default document file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["cairn.yaml", "cairn.yml"];

/// Finds the document in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no document is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(CairnError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceKind;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
project:
  name: static-site
";
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(yaml, None).unwrap();

        assert_eq!(config.project.name, "static-site");
        assert_eq!(config.project.environment, "dev");
        assert!(config.resources.is_empty());
        assert_eq!(config.engine.concurrency, 4);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
project:
  name: static-site
  environment: prod

state:
  backend: s3
  bucket: cairn-state
  prefix: static-site/prod

engine:
  concurrency: 2
  retry:
    max_attempts: 5
    initial_backoff_ms: 100

variables:
  domain:
    default: example.com
  enable_www:
    default: false

resources:
  - type: bucket
    name: site
    attributes:
      bucket_name: "${var.domain}-content"
  - type: certificate
    name: site
    attributes:
      domain_name: "${var.domain}"
    lifecycle:
      create_before_destroy: true
  - type: dns_record
    name: www
    enabled: "${var.enable_www}"
    depends_on: [bucket.site]
    attributes:
      name: "www.${var.domain}"
      type: CNAME

outputs:
  bucket:
    value: "${bucket.site.id}"
"#;
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(yaml, None).unwrap();

        assert_eq!(config.project.environment, "prod");
        assert_eq!(config.engine.concurrency, 2);
        assert_eq!(config.engine.retry.max_attempts, 5);
        assert_eq!(config.engine.retry.max_backoff_ms, 10_000);
        assert_eq!(config.variables.len(), 2);
        assert_eq!(config.resources.len(), 3);
        assert_eq!(config.resources[1].kind, ResourceKind::Certificate);
        assert!(config.resources[1].lifecycle.create_before_destroy);
        assert_eq!(config.resources[2].depends_on, vec!["bucket.site"]);
        assert_eq!(config.outputs.len(), 1);
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let parser = ConfigParser::new();
        let result = parser.parse_yaml("project: [", None);
        assert!(matches!(
            result,
            Err(CairnError::Config(ConfigError::ParseError { .. }))
        ));
    }

    #[test]
    fn test_find_config_file_in_parent() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(temp.path().join("cairn.yaml"), "project:\n  name: x\n").unwrap();
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, temp.path().join("cairn.yaml"));
    }
}
