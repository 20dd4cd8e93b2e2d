use std::time::Duration;

use thiserror::Error;

use crate::types::PluginState;

/// Unified error type for the plugin trust core.
///
/// Every variant is a value handed back to the direct caller; none of them is
/// meant to bring the host process down.
#[derive(Error, Debug)]
pub enum VcpError {
    // ── Manifest errors ────────────────────────────────────────
    #[error("manifest validation failed: {0}")]
    ManifestValidation(String),

    // ── Access control ─────────────────────────────────────────
    #[error("permission denied: {plugin_id} lacks {permission_type} for '{resource}'")]
    PermissionDenied {
        plugin_id: String,
        permission_type: String,
        resource: String,
    },

    #[error("path traversal blocked: {plugin_id} requested '{path}'")]
    PathTraversal { plugin_id: String, path: String },

    // ── Lifecycle errors ───────────────────────────────────────
    #[error("dependency resolution failed: {reason}")]
    DependencyResolution {
        reason: String,
        /// Plugins participating in the failure (cycle members, or the
        /// dependent and the missing dependency).
        plugins: Vec<String>,
    },

    #[error("invalid state transition for {plugin_id}: {from} -> {to}")]
    InvalidStateTransition {
        plugin_id: String,
        from: PluginState,
        to: PluginState,
    },

    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    #[error("plugin already installed: {name} (v{version})")]
    AlreadyInstalled { name: String, version: String },

    #[error("plugin activation failed: {plugin}: {reason}")]
    Activation { plugin: String, reason: String },

    #[error("plugin package rejected: {0}")]
    Package(String),

    #[error("command error: {0}")]
    Command(String),

    // ── Network ────────────────────────────────────────────────
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    // ── Generic wrappers ───────────────────────────────────────
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl VcpError {
    pub fn denied(
        plugin_id: impl Into<String>,
        permission_type: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self::PermissionDenied {
            plugin_id: plugin_id.into(),
            permission_type: permission_type.into(),
            resource: resource.into(),
        }
    }

    /// Security events are logged apart from ordinary policy denials.
    pub fn is_security_event(&self) -> bool {
        matches!(self, Self::PathTraversal { .. })
    }
}

/// Outbound request failures surfaced by the network proxy.
///
/// The core never retries on its own; the caller decides.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("request timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("http status {status}")]
    HttpStatus { status: u16 },

    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

pub type Result<T> = std::result::Result<T, VcpError>;
