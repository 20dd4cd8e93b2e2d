//! # vcp-plugin
//!
//! Trust boundary between a host application and third-party plugins.
//! Plugins declare what they need in `manifest.json`; the host grants it
//! explicitly, and every file or network access is checked against those
//! grants and written to an append-only audit log.
//!
//! ## Plugin Manifest
//!
//! ```json
//! {
//!   "manifestVersion": "1.0.0",
//!   "name": "weather",
//!   "version": "1.2.0",
//!   "main": "dist/index.js",
//!   "permissions": [
//!     "network.request:*.weather.example.com",
//!     "filesystem.write:AppData/weather/*",
//!     "ui.registerCommand"
//!   ],
//!   "contributes": {
//!     "commands": [{ "identifier": "weather.refresh", "title": "Refresh" }]
//!   },
//!   "dependencies": { "geo-lookup": "^2.0.0" }
//! }
//! ```
//!
//! ## Layout
//!
//! - [`manifest`]: parsing and field validation
//! - [`permissions`], [`policy`], [`audit`]: grants, approval, audit trail
//! - [`fs`], [`network`]: the sandboxed I/O surfaces
//! - [`context`]: the per-plugin capability proxy passed to hooks
//! - [`manager`]: install, activate, deactivate, uninstall

pub mod audit;
pub mod cache;
pub mod commands;
pub mod context;
pub mod fs;
pub mod host;
pub mod manager;
pub mod manifest;
pub mod network;
pub mod package;
pub mod permissions;
pub mod policy;
pub mod ratelimit;
pub mod registry;
pub mod resolver;

pub use audit::{AuditLogEntry, AuditLogger};
pub use commands::{CommandHandler, CommandRegistry};
pub use context::{PluginContext, ResourceTracker};
pub use fs::{FileSystemApi, WatchEvent, WatchHandle};
pub use host::{DeclarativeLoader, DeclarativePlugin, Plugin, PluginLoader, StaticLoader};
pub use manager::{PluginManager, PluginManagerBuilder};
pub use manifest::{PluginManifest, parse_manifest};
pub use network::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, NetworkProxy};
pub use permissions::{Permission, PermissionManager};
pub use policy::{
    AllowListPolicy, AlwaysApprove, AlwaysDeny, AuthorizationDecision, AuthorizationPolicy,
    AuthorizationRequest, ChannelPolicy, policy_from_config,
};
pub use registry::{PluginMetadata, PluginRegistry};
pub use resolver::{DependencyGraph, resolve_dependencies};
