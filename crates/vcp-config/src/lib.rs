//! # vcp-config
//!
//! Configuration for the plugin trust core. Reads from `vcp.toml`, then
//! applies environment variable overrides.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::VcpConfig;
pub use schema::{
    ConfigWarning, HostConfig, LoggingConfig, NetworkConfig, PathsConfig, PermissionsConfig,
    WarningSeverity,
};
