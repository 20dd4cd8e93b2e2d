use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use vcp_core::{PluginState, Result, VcpError};

use crate::manifest::PluginManifest;

/// Registry entry for one installed plugin.
#[derive(Debug, Clone, Serialize)]
pub struct PluginMetadata {
    pub id: String,
    pub manifest: PluginManifest,
    pub state: PluginState,
    pub install_path: PathBuf,
    pub installed_at: DateTime<Utc>,
}

impl PluginMetadata {
    pub fn new(manifest: PluginManifest, install_path: PathBuf) -> Self {
        Self {
            id: manifest.name.clone(),
            manifest,
            state: PluginState::Installed,
            install_path,
            installed_at: Utc::now(),
        }
    }

    pub fn version(&self) -> &str {
        &self.manifest.version
    }
}

/// Process-wide table of installed plugins.
///
/// Created explicitly at startup and handed to whoever needs it; clones share
/// the same table. Only the plugin manager mutates entries.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    inner: Arc<RwLock<HashMap<String, PluginMetadata>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<PluginMetadata> {
        self.inner.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().contains_key(id)
    }

    pub fn state(&self, id: &str) -> Option<PluginState> {
        self.inner.read().get(id).map(|m| m.state)
    }

    /// Add a new entry. A plugin name may be installed only once.
    pub fn insert(&self, metadata: PluginMetadata) -> Result<()> {
        let mut plugins = self.inner.write();
        if let Some(existing) = plugins.get(&metadata.id) {
            return Err(VcpError::AlreadyInstalled {
                name: existing.id.clone(),
                version: existing.manifest.version.clone(),
            });
        }
        plugins.insert(metadata.id.clone(), metadata);
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Option<PluginMetadata> {
        self.inner.write().remove(id)
    }

    /// Move `id` to `to` if the lifecycle allows it. Returns the previous state.
    /// Nothing changes on error.
    pub fn transition(&self, id: &str, to: PluginState) -> Result<PluginState> {
        let mut plugins = self.inner.write();
        let entry = plugins
            .get_mut(id)
            .ok_or_else(|| VcpError::PluginNotFound(id.to_string()))?;
        let from = entry.state;
        if !from.can_transition_to(to) {
            return Err(VcpError::InvalidStateTransition {
                plugin_id: id.to_string(),
                from,
                to,
            });
        }
        entry.state = to;
        info!(plugin = id, %from, %to, "plugin state changed");
        Ok(from)
    }

    /// Set the state without consulting the lifecycle table (rollback only).
    pub(crate) fn force_state(&self, id: &str, state: PluginState) -> bool {
        match self.inner.write().get_mut(id) {
            Some(entry) => {
                if entry.state != state {
                    info!(plugin = id, from = %entry.state, to = %state, "plugin state forced");
                }
                entry.state = state;
                true
            }
            None => false,
        }
    }

    /// Every entry, sorted by id.
    pub fn list(&self) -> Vec<PluginMetadata> {
        let mut out: Vec<PluginMetadata> = self.inner.read().values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Snapshot of the installed manifests keyed by plugin id.
    pub fn manifests(&self) -> HashMap<String, PluginManifest> {
        self.inner
            .read()
            .iter()
            .map(|(id, m)| (id.clone(), m.manifest.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }
}
