//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Halldyll Stacks - declarative infrastructure planner and apply engine.
#[derive(Parser, Debug)]
#[command(name = "halldyll-stacks")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the declaration file.
    #[arg(short, long, global = true, env = "HALLDYLL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a starter declaration file.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate declarations and the dependency graph.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Print the dependency waves.
    Graph {
        /// Only show this resource and its dependencies.
        #[arg(short, long)]
        target: Option<String>,
    },

    /// Compute and display the plan.
    ///
    /// Exits with 0 when there is nothing to do and 2 when changes are
    /// pending.
    Plan {
        /// Only plan this resource and its dependencies.
        #[arg(short, long)]
        target: Option<String>,

        /// Show changed properties.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Plan and apply changes.
    Apply {
        /// Only apply this resource and its dependencies.
        #[arg(short, long)]
        target: Option<String>,

        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Maximum concurrent provider calls (overrides the document).
        #[arg(short, long)]
        parallelism: Option<usize>,
    },

    /// Manage recorded state.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show the state of the stack.
    Show,

    /// List stacks with recorded state.
    List,

    /// Forget a resource without touching the provider.
    Rm {
        /// Resource id.
        id: String,
    },

    /// Lock the stack.
    Lock {
        /// Lock holder identifier.
        #[arg(long)]
        holder: Option<String>,
    },

    /// Unlock the stack.
    Unlock {
        /// Lock ID to unlock.
        #[arg(long)]
        lock_id: Option<String>,

        /// Force unlock (dangerous).
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
