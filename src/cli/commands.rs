//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - start: run the scheduler until Ctrl-C
//! - check: validate the configuration
//! - tree: print a process's tree
//! - reprocess/skip: operator actions on tree nodes
//! - gc: garbage collector actions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Timeslicer - time-sliced job scheduler
#[derive(Parser, Debug)]
#[command(name = "timeslicer")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the scheduler until interrupted
    Start,

    /// Validate the configuration and print the registry
    Check,

    /// Build and print the tree of a process
    Tree {
        /// Process name
        process: String,
    },

    /// Send a node back for reprocessing
    Reprocess {
        /// Process name
        process: String,

        /// Timeperiod token, e.g. 2020010100
        timeperiod: String,
    },

    /// Skip a node and its children
    Skip {
        /// Process name
        process: String,

        /// Timeperiod token, e.g. 2020010100
        timeperiod: String,
    },

    /// Garbage collector actions
    Gc {
        #[command(subcommand)]
        command: GcCommands,
    },
}

/// Garbage collector subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum GcCommands {
    /// Run an enlist pass now
    Scan,

    /// Repost enlisted work regardless of release time
    Flush {
        /// Only flush this process's queue
        process: Option<String>,
    },

    /// Print the reprocessing queues
    Queue,
}
