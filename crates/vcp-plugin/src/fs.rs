//! Sandboxed file access for plugins.
//!
//! Every path is relative to the plugin's private subtree
//! `<storage_root>/<plugin_id>/` and is presented to the permission layer as
//! `AppData/<plugin_id>/<rel>`. Absolute paths and anything escaping the
//! subtree fail with `PathTraversal` before any I/O happens.

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use vcp_core::{Result, VcpError};

use crate::audit::AuditLogger;
use crate::permissions::{PermissionManager, STORAGE_PREFIX, resolves_within};

pub const FS_READ: &str = "filesystem.read";
pub const FS_WRITE: &str = "filesystem.write";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Created,
    Modified,
    Removed,
    Other,
}

/// A change under a watched directory. `path` is relative to the plugin root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub path: String,
}

/// Keeps a watch alive. Dropping it (or calling `unwatch`) stops delivery.
pub struct WatchHandle {
    pub id: Uuid,
    pub plugin_id: String,
    pub path: String,
    watcher: Option<RecommendedWatcher>,
}

impl WatchHandle {
    pub fn unwatch(mut self) {
        self.watcher.take();
        debug!(plugin = %self.plugin_id, path = %self.path, "watch stopped");
    }

    pub fn is_active(&self) -> bool {
        self.watcher.is_some()
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle")
            .field("id", &self.id)
            .field("plugin_id", &self.plugin_id)
            .field("path", &self.path)
            .finish()
    }
}

struct Resolved {
    full: PathBuf,
    /// `AppData/<plugin>/<rel>` form handed to the permission check.
    virtual_path: String,
}

pub struct FileSystemApi {
    root: PathBuf,
    permissions: Arc<PermissionManager>,
    audit: Arc<AuditLogger>,
}

impl FileSystemApi {
    pub fn new(storage_root: &Path, permissions: Arc<PermissionManager>) -> Result<Self> {
        std::fs::create_dir_all(storage_root)?;
        Ok(Self {
            root: storage_root.canonicalize()?,
            audit: Arc::clone(permissions.audit()),
            permissions,
        })
    }

    pub fn plugin_root(&self, plugin_id: &str) -> PathBuf {
        self.root.join(plugin_id)
    }

    pub fn read(&self, plugin_id: &str, rel: &str) -> Result<Vec<u8>> {
        let resolved = self.authorize(plugin_id, rel, FS_READ)?;
        self.io(plugin_id, &resolved, std::fs::read(&resolved.full))
    }

    pub fn read_to_string(&self, plugin_id: &str, rel: &str) -> Result<String> {
        let resolved = self.authorize(plugin_id, rel, FS_READ)?;
        self.io(plugin_id, &resolved, std::fs::read_to_string(&resolved.full))
    }

    /// Atomic write: the content lands in a temp file next to the target and
    /// is renamed over it.
    pub fn write(&self, plugin_id: &str, rel: &str, bytes: &[u8]) -> Result<()> {
        let resolved = self.authorize(plugin_id, rel, FS_WRITE)?;
        let result = (|| -> std::io::Result<()> {
            let parent = resolved
                .full
                .parent()
                .ok_or_else(|| std::io::Error::other("write target has no parent"))?;
            std::fs::create_dir_all(parent)?;
            let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
            tmp.write_all(bytes)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&resolved.full).map_err(|e| e.error)?;
            Ok(())
        })();
        self.io(plugin_id, &resolved, result)?;
        debug!(plugin = plugin_id, path = %resolved.virtual_path, bytes = bytes.len(), "file written");
        Ok(())
    }

    pub fn exists(&self, plugin_id: &str, rel: &str) -> Result<bool> {
        let resolved = self.authorize(plugin_id, rel, FS_READ)?;
        Ok(resolved.full.exists())
    }

    /// Sorted entry names in a directory, optionally filtered by a glob.
    pub fn list(&self, plugin_id: &str, rel: &str, pattern: Option<&str>) -> Result<Vec<String>> {
        let pattern = pattern
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|e| {
                VcpError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("invalid glob: {e}"),
                ))
            })?;
        let resolved = self.authorize(plugin_id, rel, FS_READ)?;

        let entries = self.io(plugin_id, &resolved, std::fs::read_dir(&resolved.full))?;
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| pattern.as_ref().is_none_or(|p| p.matches(name)))
            .collect();
        names.sort();
        Ok(names)
    }

    pub fn mkdir(&self, plugin_id: &str, rel: &str) -> Result<()> {
        let resolved = self.authorize(plugin_id, rel, FS_WRITE)?;
        self.io(plugin_id, &resolved, std::fs::create_dir_all(&resolved.full))
    }

    /// Watch a path (recursively for directories).
    pub fn watch<F>(&self, plugin_id: &str, rel: &str, callback: F) -> Result<WatchHandle>
    where
        F: Fn(WatchEvent) + Send + 'static,
    {
        let resolved = self.authorize(plugin_id, rel, FS_READ)?;
        let base = self.plugin_root(plugin_id);
        std::fs::create_dir_all(&base)?;
        let base = base.canonicalize()?;
        let owner = plugin_id.to_string();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!(plugin = %owner, error = %e, "watch error");
                    return;
                }
            };
            let kind = match event.kind {
                EventKind::Create(_) => WatchEventKind::Created,
                EventKind::Modify(_) => WatchEventKind::Modified,
                EventKind::Remove(_) => WatchEventKind::Removed,
                _ => WatchEventKind::Other,
            };
            for path in &event.paths {
                let rel = path
                    .strip_prefix(&base)
                    .map(|p| p.to_string_lossy().replace('\\', "/"))
                    .unwrap_or_default();
                callback(WatchEvent { kind, path: rel });
            }
        })
        .map_err(|e| VcpError::Other(e.into()))?;

        watcher
            .watch(&resolved.full, RecursiveMode::Recursive)
            .map_err(|e| VcpError::Other(e.into()))?;

        debug!(plugin = plugin_id, path = %resolved.virtual_path, "watch started");
        Ok(WatchHandle {
            id: Uuid::new_v4(),
            plugin_id: plugin_id.to_string(),
            path: resolved.virtual_path,
            watcher: Some(watcher),
        })
    }

    /// Delete a plugin's whole private subtree. Host-only; not permission-checked.
    pub fn remove_plugin_storage(&self, plugin_id: &str) -> Result<bool> {
        if !is_single_segment(plugin_id) {
            return Err(VcpError::PathTraversal {
                plugin_id: plugin_id.to_string(),
                path: plugin_id.to_string(),
            });
        }
        let dir = self.plugin_root(plugin_id);
        if !dir.exists() {
            return Ok(false);
        }
        std::fs::remove_dir_all(&dir)?;
        self.audit
            .log(plugin_id, "filesystem.remove_storage", &virtual_path(plugin_id, ""), true);
        Ok(true)
    }

    fn authorize(&self, plugin_id: &str, rel: &str, action: &str) -> Result<Resolved> {
        let resolved = self.resolve(plugin_id, rel, action)?;
        if !self
            .permissions
            .check(plugin_id, action, &resolved.virtual_path)
        {
            return Err(VcpError::denied(plugin_id, action, resolved.virtual_path));
        }
        Ok(resolved)
    }

    fn resolve(&self, plugin_id: &str, rel: &str, action: &str) -> Result<Resolved> {
        let normalized = rel.replace('\\', "/");
        let traversal = || {
            warn!(plugin = plugin_id, path = %rel, "path traversal blocked");
            self.audit
                .log_detail(plugin_id, action, rel, false, "path_traversal");
            VcpError::PathTraversal {
                plugin_id: plugin_id.to_string(),
                path: rel.to_string(),
            }
        };

        if !is_single_segment(plugin_id) || is_absolute_like(&normalized) {
            return Err(traversal());
        }
        let mut segments = Vec::new();
        for seg in normalized.split('/') {
            match seg {
                "" | "." => {}
                ".." => return Err(traversal()),
                s => segments.push(s),
            }
        }
        let clean = segments.join("/");

        // Resolution never creates directories.
        let plugin_root = self.plugin_root(plugin_id);
        let full = plugin_root.join(&clean);
        let contained = match plugin_root.canonicalize() {
            Ok(canonical) => canonical.starts_with(&self.root) && resolves_within(&canonical, &full),
            Err(_) => resolves_within(&self.root, &full),
        };
        if !contained {
            return Err(traversal());
        }

        Ok(Resolved {
            full,
            virtual_path: virtual_path(plugin_id, &clean),
        })
    }

    fn io<T>(&self, plugin_id: &str, resolved: &Resolved, result: std::io::Result<T>) -> Result<T> {
        result.map_err(|e| {
            warn!(plugin = plugin_id, path = %resolved.virtual_path, error = %e, "filesystem operation failed");
            self.audit.log_detail(
                plugin_id,
                "filesystem.io",
                &resolved.virtual_path,
                false,
                &e.to_string(),
            );
            VcpError::Io(e)
        })
    }
}

fn virtual_path(plugin_id: &str, clean: &str) -> String {
    if clean.is_empty() {
        format!("{STORAGE_PREFIX}/{plugin_id}")
    } else {
        format!("{STORAGE_PREFIX}/{plugin_id}/{clean}")
    }
}

fn is_single_segment(s: &str) -> bool {
    !s.is_empty() && s != "." && s != ".." && !s.contains(['/', '\\'])
}

fn is_absolute_like(path: &str) -> bool {
    let b = path.as_bytes();
    path.starts_with('/') || (b.len() >= 2 && b[0].is_ascii_alphabetic() && b[1] == b':')
}
