//! CLI tool for exercising endpoint wire-up over the loopback fabric.
//!
//! Provides commands for:
//! - Wiring up two workers and delivering traffic sent before wire-up ends
//! - Inspecting how the auxiliary transport is chosen

pub mod commands;
pub mod config;

pub use commands::{Command, CommandResult, ResourceSpec, Scenario};
pub use config::CliConfig;
