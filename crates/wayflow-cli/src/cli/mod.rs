//! CLI command definitions for the `wayflow` binary.
//!
//! Uses clap derive macros for argument parsing. Workflow files are YAML
//! (or JSON when the extension is `.json`).

pub mod session;
pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Run and manage low-code workflows.
#[derive(Parser)]
#[command(name = "wayflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Parse, validate and compile a workflow file without running it.
    Validate {
        /// Path to the workflow file.
        file: PathBuf,
    },

    /// Run a workflow file in memory and print the result.
    Run {
        /// Path to the workflow file.
        file: PathBuf,

        /// Input variables as a JSON object.
        #[arg(long)]
        input: Option<String>,

        /// Start step (defaults to the only step without parents).
        #[arg(long)]
        step: Option<u64>,

        /// Record a trace of every step.
        #[arg(long)]
        trace: bool,
    },

    /// Store a workflow file, replacing the stored workflow with the same handle.
    Import {
        /// Path to the workflow file.
        file: PathBuf,

        /// Store the workflow disabled.
        #[arg(long)]
        disabled: bool,
    },

    /// Start a session of a stored workflow.
    Exec {
        /// Workflow handle or ID.
        workflow: String,

        /// Input variables as a JSON object.
        #[arg(long)]
        input: Option<String>,

        /// Start step (defaults to the only step without parents).
        #[arg(long)]
        step: Option<u64>,
    },

    /// List stored workflows.
    #[command(alias = "ls")]
    List {
        /// Only workflows whose handle or name contains this text.
        #[arg(long)]
        query: Option<String>,

        /// Include deleted workflows.
        #[arg(long)]
        deleted: bool,
    },

    /// Soft-delete a stored workflow.
    #[command(alias = "rm")]
    Delete {
        /// Workflow handle or ID.
        workflow: String,
    },

    /// Restore a deleted workflow.
    Undelete {
        /// Workflow ID.
        id: u64,
    },

    /// List sessions, newest first.
    Sessions {
        /// Only sessions of this workflow (handle or ID).
        #[arg(long)]
        workflow: Option<String>,

        /// Only sessions in this status (repeatable).
        #[arg(long)]
        status: Vec<String>,

        /// Maximum number of sessions to display.
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Show one session, including its trace and pending inputs.
    Session {
        /// Session ID.
        id: u64,
    },

    /// Supply input to a session waiting on a prompt.
    Resume {
        /// Session ID.
        session: u64,

        /// State ID of the waiting prompt.
        state: u64,

        /// Input variables as a JSON object.
        #[arg(long)]
        input: Option<String>,
    },

    /// Cancel a session.
    Cancel {
        /// Session ID.
        session: u64,
    },

    /// List functions available to function steps.
    Functions,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}
