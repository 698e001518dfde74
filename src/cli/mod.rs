//! Command-line interface for demo-forge.
//!
//! Provides commands for simulated pipeline runs and for inspecting
//! snapshots, job metadata and templates.

mod commands;

pub use commands::{parse_cli, run_with_cli};
