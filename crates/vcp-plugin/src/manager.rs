//! Plugin lifecycle.
//!
//! ```text
//! Uninstalled -> Installed -> Loaded -> Activated -> Running
//!                   ^  |                                |
//!                   |  v                                v
//!                   | Uninstalled                  Deactivated
//!                   +-----------------------------------+
//! ```
//!
//! Failed activations revert to `Installed` (Loaded -> Installed,
//! Activated -> Installed). Every registry mutation goes through
//! [`PluginRegistry::transition`]; no lock is held across a hook call or an
//! authorization prompt.

use parking_lot::Mutex;
use semver::Version;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use vcp_config::VcpConfig;
use vcp_core::{EventBus, PermissionSpec, PluginState, Result, VcpError};

use crate::audit::{AuditLogEntry, AuditLogger};
use crate::commands::CommandRegistry;
use crate::context::{ContextServices, PluginContext, ResourceTracker};
use crate::fs::FileSystemApi;
use crate::host::{DeclarativeLoader, Plugin, PluginLoader};
use crate::manifest::{MANIFEST_FILE, PluginManifest};
use crate::network::{HttpTransport, NetworkProxy, ReqwestTransport};
use crate::package::{self, StagedPackage};
use crate::permissions::PermissionManager;
use crate::policy::{AlwaysDeny, AuthorizationPolicy};
use crate::registry::{PluginMetadata, PluginRegistry};
use crate::resolver::DependencyGraph;

pub const EVENT_INSTALLED: &str = "system:plugin-installed";
pub const EVENT_ACTIVATED: &str = "system:plugin-activated";
pub const EVENT_DEACTIVATED: &str = "system:plugin-deactivated";
pub const EVENT_UNINSTALLED: &str = "system:plugin-uninstalled";

/// A loaded plugin and what its current activation has registered.
struct Instance {
    plugin: Arc<dyn Plugin>,
    tracker: Arc<ResourceTracker>,
    /// Grants obtained by the activation in progress; revoked if it fails.
    new_grants: Vec<PermissionSpec>,
}

pub struct PluginManagerBuilder {
    config: VcpConfig,
    policy: Arc<dyn AuthorizationPolicy>,
    transport: Option<Arc<dyn HttpTransport>>,
    loader: Option<Arc<dyn PluginLoader>>,
    registry: PluginRegistry,
    events: EventBus,
}

impl PluginManagerBuilder {
    pub fn policy(mut self, policy: Arc<dyn AuthorizationPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn loader(mut self, loader: Arc<dyn PluginLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn registry(mut self, registry: PluginRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> Result<PluginManager> {
        let paths = &self.config.paths;
        let host_version = Version::parse(&self.config.host.version).map_err(|e| {
            VcpError::Config(format!("host.version '{}': {e}", self.config.host.version))
        })?;

        let audit = Arc::new(AuditLogger::open(&paths.audit_dir())?);
        let storage_dir = paths.storage_dir();
        let permissions = Arc::new(PermissionManager::open(
            &paths.permissions_file(),
            &storage_dir,
            Arc::clone(&audit),
            self.policy,
        )?);
        let fs = Arc::new(FileSystemApi::new(&storage_dir, Arc::clone(&permissions))?);
        let transport: Arc<dyn HttpTransport> = match self.transport {
            Some(t) => t,
            None => Arc::new(ReqwestTransport::new(&self.config.network.user_agent)?),
        };
        let network = Arc::new(NetworkProxy::new(
            &self.config.network,
            Arc::clone(&permissions),
            transport,
        ));
        let loader = self
            .loader
            .unwrap_or_else(|| Arc::new(DeclarativeLoader::new(self.events.clone())));

        let plugin_dir = paths.plugin_dir();
        std::fs::create_dir_all(&plugin_dir)?;
        info!(
            plugin_dir = ?plugin_dir,
            storage_dir = ?storage_dir,
            policy = permissions.policy_name(),
            host_version = %host_version,
            "plugin manager ready"
        );

        Ok(PluginManager {
            registry: self.registry,
            services: ContextServices {
                permissions,
                fs,
                network,
                events: self.events,
                commands: Arc::new(CommandRegistry::new()),
            },
            audit,
            loader,
            plugin_dir,
            host_version,
            instances: Mutex::new(HashMap::new()),
        })
    }
}

pub struct PluginManager {
    registry: PluginRegistry,
    services: ContextServices,
    audit: Arc<AuditLogger>,
    loader: Arc<dyn PluginLoader>,
    plugin_dir: PathBuf,
    host_version: Version,
    instances: Mutex<HashMap<String, Instance>>,
}

impl PluginManager {
    pub fn builder(config: VcpConfig) -> PluginManagerBuilder {
        PluginManagerBuilder {
            config,
            policy: Arc::new(AlwaysDeny),
            transport: None,
            loader: None,
            registry: PluginRegistry::new(),
            events: EventBus::new(),
        }
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn permissions(&self) -> &Arc<PermissionManager> {
        &self.services.permissions
    }

    pub fn fs(&self) -> &Arc<FileSystemApi> {
        &self.services.fs
    }

    pub fn network(&self) -> &Arc<NetworkProxy> {
        &self.services.network
    }

    pub fn events(&self) -> &EventBus {
        &self.services.events
    }

    pub fn commands(&self) -> &Arc<CommandRegistry> {
        &self.services.commands
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    pub fn list(&self) -> Vec<PluginMetadata> {
        self.registry.list()
    }

    pub fn get(&self, id: &str) -> Option<PluginMetadata> {
        self.registry.get(id)
    }

    pub fn state(&self, id: &str) -> Option<PluginState> {
        self.registry.state(id)
    }

    /// A context bound to `id`, for host code acting on a plugin's behalf.
    pub fn context_for(&self, id: &str) -> PluginContext {
        let tracker = self
            .instances
            .lock()
            .get(id)
            .map(|i| Arc::clone(&i.tracker))
            .unwrap_or_default();
        PluginContext::new(id, self.services.clone(), tracker)
    }

    // ── Install ────────────────────────────────────────────────

    /// Install a zip package. On any failure nothing is left behind.
    pub async fn install(&self, zip_bytes: &[u8]) -> Result<String> {
        let staged = package::extract(zip_bytes, &self.plugin_dir)?;
        self.admit(staged)
    }

    /// Install from a `.zip` file or an unpacked plugin directory.
    pub async fn install_from_path(&self, path: &Path) -> Result<String> {
        if path.is_dir() {
            let staged = package::stage_directory(path, &self.plugin_dir)?;
            self.admit(staged)
        } else {
            let bytes = std::fs::read(path)?;
            self.install(&bytes).await
        }
    }

    fn admit(&self, staged: StagedPackage) -> Result<String> {
        let manifest = staged.manifest.clone();
        let id = manifest.name.clone();

        if let Some(existing) = self.registry.get(&id) {
            return Err(VcpError::AlreadyInstalled {
                name: id,
                version: existing.manifest.version,
            });
        }
        if !manifest.is_compatible_with(&self.host_version) {
            return Err(VcpError::Package(format!(
                "'{id}' requires vcp {}, host is {}",
                manifest.engines.vcp.as_deref().unwrap_or("*"),
                self.host_version
            )));
        }

        let install_path = staged.commit(&self.plugin_dir.join(&id))?;
        if let Err(e) = self
            .registry
            .insert(PluginMetadata::new(manifest.clone(), install_path.clone()))
        {
            let _ = std::fs::remove_dir_all(&install_path);
            return Err(e);
        }

        info!(plugin = %id, version = %manifest.version, path = ?install_path, "plugin installed");
        self.audit.log(&id, "plugin.install", &manifest.version, true);
        self.publish(EVENT_INSTALLED, &id, &manifest.version);
        Ok(id)
    }

    /// Rebuild the registry from `plugin_dir` (startup). Broken packages are
    /// skipped with a warning; leftover staging directories are removed.
    pub fn discover(&self) -> Result<Vec<String>> {
        let mut found = Vec::new();
        if !self.plugin_dir.exists() {
            info!(plugin_dir = ?self.plugin_dir, "plugin directory does not exist, skipping discovery");
            return Ok(found);
        }

        for entry in std::fs::read_dir(&self.plugin_dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let Some(dir_name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            if dir_name.starts_with(".staging-") {
                if let Err(e) = std::fs::remove_dir_all(&path) {
                    warn!(path = ?path, error = %e, "failed to remove stale staging directory");
                }
                continue;
            }

            let manifest = match PluginManifest::from_path(&path.join(MANIFEST_FILE)) {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = ?path, error = %e, "skipping plugin with unreadable manifest");
                    continue;
                }
            };
            if manifest.name != dir_name {
                warn!(path = ?path, name = %manifest.name, "plugin directory does not match manifest name, skipping");
                continue;
            }
            if self.registry.contains(&manifest.name) {
                continue;
            }
            let id = manifest.name.clone();
            self.registry.insert(PluginMetadata::new(manifest, path))?;
            debug!(plugin = %id, "discovered plugin");
            found.push(id);
        }

        found.sort();
        info!(count = found.len(), "plugin discovery complete");
        Ok(found)
    }

    // ── Dependencies ───────────────────────────────────────────

    /// Dependency-first activation order for `roots`, computed over every
    /// installed manifest.
    pub fn resolve_dependencies(&self, roots: &[String]) -> Result<Vec<String>> {
        DependencyGraph::build(&self.registry.manifests()).resolve(roots)
    }

    fn require_running_dependencies(&self, id: &str) -> Result<()> {
        let order = self.resolve_dependencies(&[id.to_string()])?;
        for dep in order.iter().filter(|d| d.as_str() != id) {
            let state = self.registry.state(dep);
            if state != Some(PluginState::Running) {
                return Err(VcpError::DependencyResolution {
                    reason: format!(
                        "'{id}' needs '{dep}' running (it is {})",
                        state.map_or("missing", |s| s.as_str())
                    ),
                    plugins: vec![id.to_string(), dep.clone()],
                });
            }
        }
        Ok(())
    }

    // ── Lifecycle ──────────────────────────────────────────────

    /// Installed -> Loaded: instantiate the plugin and verify its entry file.
    pub fn load(&self, id: &str) -> Result<()> {
        let metadata = self
            .registry
            .get(id)
            .ok_or_else(|| VcpError::PluginNotFound(id.to_string()))?;
        self.registry.transition(id, PluginState::Loaded)?;

        match self.instantiate(&metadata) {
            Ok(plugin) => {
                self.instances.lock().insert(
                    id.to_string(),
                    Instance {
                        plugin,
                        tracker: Arc::new(ResourceTracker::new()),
                        new_grants: Vec::new(),
                    },
                );
                debug!(plugin = id, "plugin loaded");
                Ok(())
            }
            Err(e) => {
                self.registry.transition(id, PluginState::Installed)?;
                Err(e)
            }
        }
    }

    fn instantiate(&self, metadata: &PluginMetadata) -> Result<Arc<dyn Plugin>> {
        let manifest = &metadata.manifest;
        if manifest.checksum.is_some() {
            let main = std::fs::read(metadata.install_path.join(&manifest.main))?;
            if !manifest.verify_checksum(&main) {
                return Err(VcpError::Activation {
                    plugin: metadata.id.clone(),
                    reason: format!("checksum mismatch for '{}'", manifest.main),
                });
            }
        }
        self.loader.load(metadata)
    }

    /// Activate an `Installed` or `Loaded` plugin.
    ///
    /// Every declared permission must be granted (asking the authorization
    /// policy for missing ones). A refusal reverts the plugin to `Installed`
    /// and revokes whatever this attempt granted. A failing `activate` hook
    /// leaves it `Activated`; see [`activate_with_rollback`](Self::activate_with_rollback).
    pub async fn activate(&self, id: &str) -> Result<()> {
        let metadata = self
            .registry
            .get(id)
            .ok_or_else(|| VcpError::PluginNotFound(id.to_string()))?;
        match metadata.state {
            PluginState::Installed | PluginState::Loaded => {}
            from => {
                return Err(VcpError::InvalidStateTransition {
                    plugin_id: id.to_string(),
                    from,
                    to: PluginState::Activated,
                });
            }
        }
        self.require_running_dependencies(id)?;
        if metadata.state == PluginState::Installed {
            self.load(id)?;
        }

        if let Err(e) = self.authorize_permissions(id, &metadata.manifest).await {
            self.unload(id);
            self.registry.transition(id, PluginState::Installed)?;
            self.audit.record(
                AuditLogEntry::new(id, "plugin.activate", metadata.version(), false)
                    .with_detail("permission_denied"),
            );
            return Err(e);
        }

        self.registry.transition(id, PluginState::Activated)?;

        let (plugin, tracker) = {
            let instances = self.instances.lock();
            let instance = instances
                .get(id)
                .ok_or_else(|| VcpError::PluginNotFound(id.to_string()))?;
            (Arc::clone(&instance.plugin), Arc::clone(&instance.tracker))
        };
        let ctx = PluginContext::new(id, self.services.clone(), tracker);

        if let Err(e) = plugin.activate(&ctx).await {
            warn!(plugin = id, error = %e, "activate hook failed");
            self.audit.log_detail(id, "plugin.activate", metadata.version(), false, "hook_failed");
            return Err(VcpError::Activation {
                plugin: id.to_string(),
                reason: e.to_string(),
            });
        }

        self.registry.transition(id, PluginState::Running)?;
        if let Some(instance) = self.instances.lock().get_mut(id) {
            instance.new_grants.clear();
        }
        info!(plugin = id, version = %metadata.manifest.version, "plugin activated");
        self.audit.log(id, "plugin.activate", metadata.version(), true);
        self.publish(EVENT_ACTIVATED, id, metadata.version());
        Ok(())
    }

    async fn authorize_permissions(&self, id: &str, manifest: &PluginManifest) -> Result<()> {
        let permissions = &self.services.permissions;
        for spec in manifest.permission_specs() {
            let permission_type = spec.permission_type();
            if permissions.is_granted(id, &permission_type, spec.scope.as_deref()) {
                continue;
            }
            if !permissions.request_user_authorization(id, &spec).await {
                self.revoke_new_grants(id);
                return Err(VcpError::denied(
                    id,
                    permission_type,
                    spec.scope.clone().unwrap_or_else(|| "*".to_string()),
                ));
            }
            if let Some(instance) = self.instances.lock().get_mut(id) {
                instance.new_grants.push(spec);
            }
        }
        Ok(())
    }

    fn revoke_new_grants(&self, id: &str) {
        let grants = self
            .instances
            .lock()
            .get_mut(id)
            .map(|i| std::mem::take(&mut i.new_grants))
            .unwrap_or_default();
        for spec in grants {
            if let Err(e) = self
                .services
                .permissions
                .revoke(id, &spec.permission_type(), spec.scope.as_deref())
            {
                warn!(plugin = id, permission = %spec, error = %e, "failed to revoke grant from failed activation");
            }
        }
    }

    fn unload(&self, id: &str) {
        self.instances.lock().remove(id);
    }

    /// [`activate`](Self::activate), and on failure tear down whatever the
    /// attempt left behind and force the plugin back to `Installed`.
    pub async fn activate_with_rollback(&self, id: &str) -> Result<()> {
        match self.activate(id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.rollback(id).await;
                Err(e)
            }
        }
    }

    async fn rollback(&self, id: &str) {
        let Some(state) = self.registry.state(id) else {
            return;
        };
        let has_instance = self.instances.lock().contains_key(id);
        match state {
            PluginState::Loaded | PluginState::Activated => {}
            PluginState::Installed if has_instance => {}
            // Nothing this attempt could have left behind (e.g. already running).
            _ => return,
        }

        let instance = self.instances.lock().remove(id);
        if let Some(instance) = instance {
            let ctx = PluginContext::new(id, self.services.clone(), Arc::clone(&instance.tracker));
            if let Err(e) = instance.plugin.deactivate(&ctx).await {
                debug!(plugin = id, error = %e, "deactivate hook failed during rollback");
            }
            let disposed = instance
                .tracker
                .dispose(&self.services.events, &self.services.commands);
            for spec in &instance.new_grants {
                if let Err(e) =
                    self.services
                        .permissions
                        .revoke(id, &spec.permission_type(), spec.scope.as_deref())
                {
                    warn!(plugin = id, permission = %spec, error = %e, "failed to revoke grant during rollback");
                }
            }
            debug!(plugin = id, released = disposed.total(), "rollback released resources");
        }
        // Commands registered outside the tracker still belong to the plugin.
        self.services.commands.unregister_plugin(id);
        self.registry.force_state(id, PluginState::Installed);
        warn!(plugin = id, from = %state, "activation rolled back");
        self.audit.log_detail(id, "plugin.rollback", state.as_str(), true, "rolled_back");
    }

    /// Resolve `id`'s dependencies and activate them all in order. If any
    /// step fails, plugins started by this call are deactivated again.
    pub async fn activate_with_dependencies(&self, id: &str) -> Result<Vec<String>> {
        let order = self.resolve_dependencies(&[id.to_string()])?;
        let mut started: Vec<String> = Vec::new();

        for plugin in &order {
            if self.registry.state(plugin) == Some(PluginState::Running) {
                continue;
            }
            if let Err(e) = self.activate_with_rollback(plugin).await {
                for done in started.iter().rev() {
                    if let Err(undo) = self.deactivate(done).await {
                        warn!(plugin = %done, error = %undo, "failed to undo dependency activation");
                    }
                }
                return Err(e);
            }
            started.push(plugin.clone());
        }
        Ok(order)
    }

    /// Running -> Deactivated -> Installed. Hook errors are reported after
    /// everything the plugin registered has been released.
    pub async fn deactivate(&self, id: &str) -> Result<()> {
        let metadata = self
            .registry
            .get(id)
            .ok_or_else(|| VcpError::PluginNotFound(id.to_string()))?;
        if metadata.state != PluginState::Running {
            return Err(VcpError::InvalidStateTransition {
                plugin_id: id.to_string(),
                from: metadata.state,
                to: PluginState::Deactivated,
            });
        }
        let graph = DependencyGraph::build(&self.registry.manifests());
        let running_dependents: Vec<String> = graph
            .dependents(id)
            .into_iter()
            .filter(|d| self.registry.state(d) == Some(PluginState::Running))
            .collect();
        if !running_dependents.is_empty() {
            return Err(VcpError::DependencyResolution {
                reason: format!(
                    "'{id}' is required by running plugin(s): {}",
                    running_dependents.join(", ")
                ),
                plugins: std::iter::once(id.to_string()).chain(running_dependents).collect(),
            });
        }

        self.registry.transition(id, PluginState::Deactivated)?;

        let instance = self.instances.lock().remove(id);
        let mut hook_error = None;
        if let Some(instance) = instance {
            let ctx = PluginContext::new(id, self.services.clone(), Arc::clone(&instance.tracker));
            if let Err(e) = instance.plugin.deactivate(&ctx).await {
                warn!(plugin = id, error = %e, "deactivate hook failed");
                hook_error = Some(e);
            }
            let disposed = instance
                .tracker
                .dispose(&self.services.events, &self.services.commands);
            debug!(
                plugin = id,
                commands = disposed.commands,
                subscriptions = disposed.subscriptions,
                watches = disposed.watches,
                "plugin resources released"
            );
        }
        self.services.commands.unregister_plugin(id);

        self.registry.transition(id, PluginState::Installed)?;
        info!(plugin = id, "plugin deactivated");
        self.audit
            .log(id, "plugin.deactivate", metadata.version(), hook_error.is_none());
        self.publish(EVENT_DEACTIVATED, id, metadata.version());

        match hook_error {
            Some(e) => Err(VcpError::Activation {
                plugin: id.to_string(),
                reason: format!("deactivate hook failed: {e}"),
            }),
            None => Ok(()),
        }
    }

    /// Remove an `Installed` plugin: registry entry, grants, private storage,
    /// rate-limit state, and package files.
    pub async fn uninstall(&self, id: &str) -> Result<()> {
        let metadata = self
            .registry
            .get(id)
            .ok_or_else(|| VcpError::PluginNotFound(id.to_string()))?;
        self.registry.transition(id, PluginState::Uninstalled)?;
        self.registry.remove(id);
        self.unload(id);

        let dependents = DependencyGraph::build(&self.registry.manifests()).dependents(id);
        if !dependents.is_empty() {
            warn!(plugin = id, dependents = ?dependents, "uninstalling a plugin other plugins depend on");
        }

        let revoked = self.services.permissions.revoke_all(id)?;
        self.services.fs.remove_plugin_storage(id)?;
        self.services.network.forget_plugin(id);
        if metadata.install_path.exists() {
            std::fs::remove_dir_all(&metadata.install_path)?;
        }

        info!(plugin = id, revoked, "plugin uninstalled");
        self.audit.log(id, "plugin.uninstall", metadata.version(), true);
        self.publish(EVENT_UNINSTALLED, id, metadata.version());
        Ok(())
    }

    /// Deactivate every running plugin (dependents first) and clear the
    /// registry. Returns how many plugins were stopped.
    pub async fn shutdown(&self) -> usize {
        let running: Vec<String> = self
            .registry
            .list()
            .into_iter()
            .filter(|m| m.state == PluginState::Running)
            .map(|m| m.id)
            .collect();
        let order = self
            .resolve_dependencies(&running)
            .unwrap_or_else(|_| running.clone());

        let mut stopped = 0;
        for id in order.iter().rev() {
            if self.registry.state(id) != Some(PluginState::Running) {
                continue;
            }
            match self.deactivate(id).await {
                Ok(()) => stopped += 1,
                Err(e) => {
                    warn!(plugin = %id, error = %e, "error during shutdown");
                    if self.registry.state(id) == Some(PluginState::Installed) {
                        stopped += 1;
                    }
                }
            }
        }

        self.instances.lock().clear();
        self.registry.clear();
        info!(stopped, "plugin manager shut down");
        stopped
    }

    fn publish(&self, event: &str, id: &str, version: &str) {
        self.services
            .events
            .emit(event, &json!({ "pluginId": id, "version": version }));
    }
}
