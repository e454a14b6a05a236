//! CLI command definitions and dispatch for the `dagrun` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod definition;
pub mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Run DAG workflows as units of work.
#[derive(Parser)]
#[command(name = "dagrun", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Engine configuration file.
    #[arg(long, global = true, env = "DAGRUN_CONFIG", default_value = "dagrun.toml")]
    pub config: PathBuf,

    /// Directory holding local unit, workspace and secret state.
    #[arg(long, global = true, env = "DAGRUN_WORK_DIR", default_value = ".dagrun")]
    pub work_dir: PathBuf,

    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, global = true)]
    pub otel: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a definition file and print its shape.
    Validate {
        /// Definition file (.json or .toml).
        file: PathBuf,
    },

    /// Store a definition as a new version.
    Apply {
        /// Definition file (.json or .toml).
        file: PathBuf,

        /// Definition name (defaults to the file stem).
        #[arg(long)]
        name: Option<String>,

        #[arg(long, short, default_value = "default")]
        namespace: String,
    },

    /// Delete every version of a definition and its runs.
    #[command(alias = "rm")]
    Delete {
        name: String,

        #[arg(long, short, default_value = "default")]
        namespace: String,
    },

    /// Manage reusable tasks.
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },

    /// Start a run and execute it to completion.
    Run {
        /// Definition name.
        dag: String,

        /// Instance name (generated when omitted).
        #[arg(long)]
        instance: Option<String>,

        #[arg(long, short, default_value = "default")]
        namespace: String,

        /// Parameter override, `NAME=VALUE`.
        #[arg(long = "param", value_name = "NAME=VALUE")]
        params: Vec<String>,

        /// Secret-backed parameter override, `NAME=SECRET`.
        #[arg(long = "secret-param", value_name = "NAME=SECRET")]
        secret_params: Vec<String>,
    },

    /// Run the engine: watch units, schedule definitions, deliver webhooks.
    Serve,
}

#[derive(Subcommand)]
pub enum TaskCommand {
    /// Store a reusable task as a new version.
    Apply {
        /// Task file (.json or .toml).
        file: PathBuf,

        #[arg(long)]
        name: Option<String>,

        #[arg(long, short, default_value = "default")]
        namespace: String,
    },

    /// Delete a reusable task no definition uses.
    Delete {
        name: String,

        #[arg(long, short, default_value = "default")]
        namespace: String,
    },
}
