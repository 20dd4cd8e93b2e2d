//! # vcp-cli
//!
//! Command-line front end for the plugin trust core.
//!
//! ## Commands
//!
//! - `vcp plugin`: Install, inspect, activate and remove plugins
//! - `vcp permission`: List, grant, revoke and check permission grants
//! - `vcp logs`: Show recent audit log entries
//! - `vcp config`: Show the effective configuration

pub mod commands;

pub use commands::Cli;
