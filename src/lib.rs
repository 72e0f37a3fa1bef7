// ============================================================================
// Linting - Dangerous or non-idiomatic practices are flagged
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![warn(missing_docs)]                // All public items should be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![warn(unused_imports)]
#![warn(unused_variables)]

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Cairn
//!
//! A minimal declarative infrastructure reconciler.
//!
//! ## Overview
//!
//! Cairn reads a document describing the resources you want (buckets,
//! certificates, CDN distributions, DNS records, access policies), compares
//! it with the last-known state and converges the remote side:
//!
//! - Resources reference each other's attributes; references become graph
//!   edges and values resolved at apply time
//! - A plan lists the create, update, replace and delete actions in
//!   dependency order without touching anything
//! - Apply runs independent actions concurrently, retries transient
//!   provider errors and persists state after every action
//! - Drift between state and the remote side is detected before planning
//!
//! ## Architecture
//!
//! 1. **Desired state**: `cairn.yaml`, built into a [`graph::ResourceGraph`]
//! 2. **Recorded state**: a versioned JSON document behind a [`state::StateStore`]
//! 3. **Plan**: [`planner::Planner`] diffs the two into a [`planner::Plan`]
//! 4. **Apply**: [`executor::Executor`] runs the plan through the providers
//! 5. **Reconciler**: [`reconciler::Reconciler`] ties one cycle together
//!    under the state lock
//!
//! ## Modules
//!
//! - [`config`]: Document parsing, variables and validation
//! - [`graph`]: Resource graph and deferred expressions
//! - [`provider`]: Provider interface, retry policy and the sandbox provider
//! - [`state`]: State storage backends (local, S3, memory) and locking
//! - [`planner`]: Attribute diffing and plan construction
//! - [`executor`]: Concurrent plan execution
//! - [`reconciler`]: Plan/apply cycles, drift and outputs
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: my-site
//!   environment: prod
//!
//! resources:
//!   - type: bucket
//!     name: site
//!     attributes:
//!       bucket_name: my-site-content
//!   - type: access_policy
//!     name: read
//!     attributes:
//!       bucket: "${bucket.site.id}"
//!       principal: "*"
//!
//! outputs:
//!   bucket_domain:
//!     value: "${bucket.site.domain_name}"
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod resource;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, InfraConfig};
pub use error::{CairnError, Result};
pub use executor::{ApplyReport, Executor, NodeState};
pub use graph::{GraphBuilder, ResourceGraph};
pub use planner::{ChangeAction, Plan, Planner};
pub use provider::{Provider, ProviderRegistry, SandboxRemote};
pub use reconciler::{DriftReport, ReconciliationResult, Reconciler};
pub use resource::{Attributes, ResourceId, ResourceKind};
pub use state::{LocalStateStore, MemoryStateStore, S3StateStore, StateManager, StateStore};
