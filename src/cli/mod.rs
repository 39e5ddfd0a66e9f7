//! Command-line interface definitions for the `overcast` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `overcast` binary.
#[derive(Debug, Parser)]
#[command(
    name = "overcast",
    about = "Provision throwaway hosts for integration tests and tear them down again",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Acquire hosts, print their addresses, and tear them down on Ctrl-C.
    #[command(
        name = "up",
        about = "Acquire hosts, print their addresses, and tear them down on Ctrl-C"
    )]
    Up(UpCommand),
    /// Validate host configuration without creating anything.
    #[command(name = "check", about = "Validate host configuration without creating anything")]
    Check(CheckCommand),
}

/// Arguments for the `overcast up` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct UpCommand {
    /// Leave the hosts running and exit once they are ready.
    #[arg(long)]
    pub(crate) keep: bool,
    /// Labels of the hosts to acquire, as configured in the host properties.
    #[arg(required = true, value_name = "LABEL")]
    pub(crate) labels: Vec<String>,
}

/// Arguments for the `overcast check` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct CheckCommand {
    /// Labels of the hosts to validate.
    #[arg(required = true, value_name = "LABEL")]
    pub(crate) labels: Vec<String>,
}
