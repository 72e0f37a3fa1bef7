//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Cairn - minimal declarative infrastructure reconciler.
#[derive(Parser, Debug)]
#[command(name = "cairn")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the document (defaults to `cairn.yaml` in the current or a parent directory).
    #[arg(short, long, global = true, env = "CAIRN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Log format (text, json).
    #[arg(long, global = true, default_value = "text", env = "CAIRN_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Set a variable (`NAME=VALUE`); may be repeated.
    #[arg(long = "var", global = true, value_name = "NAME=VALUE")]
    pub vars: Vec<String>,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new project.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the document and build the resource graph.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Show the changes an apply would make.
    Plan {
        /// Exit with 2 when changes are pending, 0 when there are none.
        #[arg(long)]
        detailed_exitcode: bool,

        /// Plan the deletion of every tracked resource.
        #[arg(long)]
        destroy: bool,

        /// Plan against recorded state without reading the providers.
        #[arg(long)]
        no_refresh: bool,
    },

    /// Plan and apply changes.
    Apply {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Do not refresh state from the providers first.
        #[arg(long)]
        no_refresh: bool,
    },

    /// Delete every tracked resource.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Compare recorded state with the providers without changing anything.
    Drift,

    /// Write the providers' current attributes into state.
    Refresh,

    /// Show output values.
    Output {
        /// Output name (all outputs if omitted).
        name: Option<String>,
    },

    /// Print the resource graph in DOT format.
    Graph,

    /// Manage state.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show the state summary and history.
    Show,

    /// List tracked resources.
    List,

    /// Stop tracking a resource without deleting it.
    Rm {
        /// Resource id (`kind.name`).
        id: String,
    },

    /// Lock the state.
    Lock {
        /// Lock holder identifier.
        #[arg(long)]
        holder: Option<String>,
    },

    /// Unlock the state.
    Unlock {
        /// Lock ID to unlock.
        #[arg(long)]
        lock_id: Option<String>,

        /// Force unlock regardless of holder.
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

/// Log format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable log lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_plan_flags_and_vars() {
        let cli = Cli::try_parse_from([
            "cairn",
            "plan",
            "--detailed-exitcode",
            "--var",
            "env=prod",
            "--var",
            "replicas=2",
            "--output",
            "json",
        ])
        .unwrap();

        assert_eq!(cli.vars, vec!["env=prod", "replicas=2"]);
        assert_eq!(cli.output, OutputFormat::Json);
        assert!(matches!(
            cli.command,
            Commands::Plan {
                detailed_exitcode: true,
                destroy: false,
                no_refresh: false
            }
        ));
    }

    #[test]
    fn test_state_rm() {
        let cli = Cli::try_parse_from(["cairn", "state", "rm", "bucket.site"]).unwrap();
        match cli.command {
            Commands::State {
                command: StateCommands::Rm { id },
            } => assert_eq!(id, "bucket.site"),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
