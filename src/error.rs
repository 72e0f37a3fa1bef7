//! Error types for the Cairn reconciler.
//!
//! This module provides the error hierarchy for every stage of a
//! plan/apply cycle: document loading, graph construction, provider calls,
//! state management, planning, and reconciliation.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the Cairn reconciler.
#[derive(Debug, Error)]
pub enum CairnError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource graph construction errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Provider errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Reconciliation errors.
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// A declared variable has no default and no supplied value.
    #[error("Variable '{name}' has no value (set a default, CAIRN_VAR_{name}, or --var {name}=...)")]
    MissingVariable {
        /// Name of the variable.
        name: String,
    },

    /// A `--var` flag could not be parsed.
    #[error("Invalid variable assignment '{spec}', expected NAME=VALUE")]
    InvalidVariableAssignment {
        /// The raw flag value.
        spec: String,
    },
}

/// Errors raised while building the resource graph.
///
/// All of these are build-time errors: they abort the cycle before any
/// provider is called.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The declared dependencies form a cycle.
    #[error("Dependency cycle detected: {}", cycle.join(" -> "))]
    Cycle {
        /// Resource ids participating in the cycle, first repeated at the end.
        cycle: Vec<String>,
    },

    /// An expression refers to a resource or variable that does not exist.
    #[error("Unresolved reference in {from}: '{reference}' does not exist")]
    UnresolvedReference {
        /// Resource holding the reference.
        from: String,
        /// The reference as written.
        reference: String,
    },

    /// An interpolation expression is malformed.
    #[error("Invalid expression in {from}: '{expression}' ({reason})")]
    InvalidExpression {
        /// Resource holding the expression.
        from: String,
        /// The expression as written.
        expression: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Two resources share the same identifier.
    #[error("Duplicate resource: {id}")]
    DuplicateResource {
        /// The duplicated identifier.
        id: String,
    },
}

/// Errors returned by providers.
///
/// Transient errors are eligible for retry; permanent errors fail the node.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// A failure that may succeed when retried (throttling, timeouts).
    #[error("transient: {message}")]
    Transient {
        /// Description of the failure.
        message: String,
    },

    /// A failure that will not succeed when retried.
    #[error("permanent: {message}")]
    Permanent {
        /// Description of the failure.
        message: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// The persisted state changed underneath us, or its checksum no longer
    /// matches its content. Requires operator intervention.
    #[error("State conflict: {message}")]
    Conflict {
        /// Description of the conflict.
        message: String,
    },

    /// State could not be read or decoded.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Local filesystem backend error.
    #[error("Local state backend error: {message}")]
    Backend {
        /// Description of the error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State format version mismatch.
    #[error("State format version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Supported format version.
        expected: u32,
        /// Version found on disk.
        found: u32,
    },

    /// No entry exists for the resource.
    #[error("No state entry for {id}")]
    EntryNotFound {
        /// Resource identifier.
        id: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A resource protected by `prevent_destroy` would be destroyed.
    #[error("Resource {resource} has prevent_destroy set but the plan would {action} it")]
    PreventDestroy {
        /// Protected resource.
        resource: String,
        /// Planned action (delete or replace).
        action: String,
    },

    /// A deferred value could not be resolved while planning.
    #[error("Failed to resolve {reference} for {resource}")]
    UnresolvedValue {
        /// Resource being planned.
        resource: String,
        /// Reference that could not be resolved.
        reference: String,
    },
}

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The plan recomputed under the lock differs from the one confirmed.
    #[error("Plan {confirmed} is out of date (now {current}); the state or the remote side changed, plan again")]
    StalePlan {
        /// Fingerprint of the confirmed plan.
        confirmed: String,
        /// Fingerprint of the plan computed under the lock.
        current: String,
    },

    /// An output references something that is not in state.
    #[error("Output '{name}' cannot be resolved: {reason}")]
    OutputUnavailable {
        /// Output name.
        name: String,
        /// Why it is unavailable.
        reason: String,
    },
}

/// Result type alias for Cairn operations.
pub type Result<T> = std::result::Result<T, CairnError>;

impl CairnError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is a state conflict.
    #[must_use]
    pub const fn is_state_conflict(&self) -> bool {
        matches!(
            self,
            Self::State(StateError::Conflict { .. } | StateError::Corrupted { .. })
        )
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl ProviderError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Creates a permanent error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    /// Returns true if the error may succeed on retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Returns the error message without the classification prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Transient { message } | Self::Permanent { message } => message,
        }
    }

    /// Promotes a transient error to permanent once retries are exhausted.
    #[must_use]
    pub fn promote(self, attempts: u32) -> Self {
        match self {
            Self::Transient { message } => Self::Permanent {
                message: format!("{message} (gave up after {attempts} attempts)"),
            },
            permanent @ Self::Permanent { .. } => permanent,
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a local backend error with the given message.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates a conflict error with the given message.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}
