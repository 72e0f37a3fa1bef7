//! CLI module for the Cairn reconciler.
//!
//! This module provides the command-line interface: argument parsing and
//! text/JSON rendering of plans, reports, drift and state.

mod commands;
mod output;

pub use commands::{Cli, Commands, LogFormat, OutputFormat, StateCommands};
pub use output::OutputFormatter;
