//! CLI module for timeslicer - command-line interface and subcommands.
//!
//! Provides the main entry point with subcommands for running the scheduler,
//! inspecting trees and operator actions.

pub mod commands;

pub use commands::Cli;
