//! The capability proxy handed to plugin hooks.
//!
//! A [`PluginContext`] is bound to one plugin id. It exposes file, network,
//! event, and command operations, each checked against that plugin's grants,
//! and never the underlying services themselves. Everything a plugin
//! registers through it is recorded so it can be torn down on deactivation.

use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

use vcp_core::{EventBus, Result, Subscription, VcpError, event::is_conventional_name};

use crate::commands::{CommandHandler, CommandRegistry};
use crate::fs::{FileSystemApi, WatchEvent, WatchHandle};
use crate::network::{HttpRequest, HttpResponse, NetworkProxy};
use crate::permissions::PermissionManager;

pub const UI_REGISTER_COMMAND: &str = "ui.registerCommand";
pub const SYSTEM_NOTIFY: &str = "system.notify";

/// Counts of what a [`ResourceTracker::dispose`] call removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Disposed {
    pub commands: usize,
    pub subscriptions: usize,
    pub watches: usize,
}

impl Disposed {
    pub fn total(&self) -> usize {
        self.commands + self.subscriptions + self.watches
    }
}

/// Everything one activation registered.
#[derive(Default)]
pub struct ResourceTracker {
    commands: Mutex<Vec<String>>,
    subscriptions: Mutex<Vec<Subscription>>,
    watches: Mutex<Vec<WatchHandle>>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track_command(&self, id: &str) {
        self.commands.lock().push(id.to_string());
    }

    pub fn track_subscription(&self, subscription: Subscription) {
        self.subscriptions.lock().push(subscription);
    }

    pub fn track_watch(&self, handle: WatchHandle) {
        self.watches.lock().push(handle);
    }

    pub fn is_empty(&self) -> bool {
        self.commands.lock().is_empty()
            && self.subscriptions.lock().is_empty()
            && self.watches.lock().is_empty()
    }

    /// Unregister every tracked command and listener and stop every watch.
    pub fn dispose(&self, events: &EventBus, commands: &CommandRegistry) -> Disposed {
        let ids = std::mem::take(&mut *self.commands.lock());
        let subs = std::mem::take(&mut *self.subscriptions.lock());
        let watches = std::mem::take(&mut *self.watches.lock());

        let mut disposed = Disposed::default();
        for id in ids {
            if commands.unregister(&id) {
                disposed.commands += 1;
            }
        }
        for sub in subs {
            if events.off(&sub) {
                disposed.subscriptions += 1;
            }
        }
        disposed.watches = watches.len();
        for watch in watches {
            watch.unwatch();
        }
        disposed
    }
}

/// Shared host services a context forwards to.
#[derive(Clone)]
pub struct ContextServices {
    pub permissions: Arc<PermissionManager>,
    pub fs: Arc<FileSystemApi>,
    pub network: Arc<NetworkProxy>,
    pub events: EventBus,
    pub commands: Arc<CommandRegistry>,
}

pub struct PluginContext {
    plugin_id: String,
    services: ContextServices,
    tracker: Arc<ResourceTracker>,
}

impl PluginContext {
    pub fn new(plugin_id: &str, services: ContextServices, tracker: Arc<ResourceTracker>) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            services,
            tracker,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn tracker(&self) -> &Arc<ResourceTracker> {
        &self.tracker
    }

    pub fn has_permission(&self, permission_type: &str, resource: &str) -> bool {
        self.services
            .permissions
            .check(&self.plugin_id, permission_type, resource)
    }

    // ── Files ──────────────────────────────────────────────────

    pub fn read(&self, rel: &str) -> Result<Vec<u8>> {
        self.services.fs.read(&self.plugin_id, rel)
    }

    pub fn read_to_string(&self, rel: &str) -> Result<String> {
        self.services.fs.read_to_string(&self.plugin_id, rel)
    }

    pub fn write(&self, rel: &str, bytes: &[u8]) -> Result<()> {
        self.services.fs.write(&self.plugin_id, rel, bytes)
    }

    pub fn exists(&self, rel: &str) -> Result<bool> {
        self.services.fs.exists(&self.plugin_id, rel)
    }

    pub fn list(&self, rel: &str, pattern: Option<&str>) -> Result<Vec<String>> {
        self.services.fs.list(&self.plugin_id, rel, pattern)
    }

    pub fn mkdir(&self, rel: &str) -> Result<()> {
        self.services.fs.mkdir(&self.plugin_id, rel)
    }

    /// Watch a path. The watch lives until the plugin is deactivated.
    pub fn watch<F>(&self, rel: &str, callback: F) -> Result<()>
    where
        F: Fn(WatchEvent) + Send + 'static,
    {
        let handle = self.services.fs.watch(&self.plugin_id, rel, callback)?;
        self.tracker.track_watch(handle);
        Ok(())
    }

    // ── Network ────────────────────────────────────────────────

    pub async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.services.network.request(&self.plugin_id, request).await
    }

    // ── Events ─────────────────────────────────────────────────

    /// Subscribe to an event. The subscription is removed on deactivation.
    pub fn on<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        if !is_conventional_name(event) {
            warn!(plugin = %self.plugin_id, event, "subscribing to unconventional event name");
        }
        let sub = self.services.events.on(event, handler);
        self.tracker.track_subscription(sub.clone());
        sub
    }

    pub fn off(&self, subscription: &Subscription) -> bool {
        self.services.events.off(subscription)
    }

    /// Publish `<plugin>:<name>`. Plugins cannot publish in another
    /// plugin's namespace or in `system:`.
    pub fn emit(&self, name: &str, payload: &Value) -> Result<usize> {
        let event = if name.contains(':') {
            name.to_string()
        } else {
            format!("{}:{name}", self.plugin_id)
        };
        let own_namespace = event
            .split_once(':')
            .is_some_and(|(ns, rest)| ns == self.plugin_id && !rest.is_empty());
        if !own_namespace {
            warn!(plugin = %self.plugin_id, %event, "emit outside own namespace refused");
            return Err(VcpError::denied(&self.plugin_id, "events.emit", event));
        }
        Ok(self.services.events.emit(&event, payload))
    }

    // ── Commands ───────────────────────────────────────────────

    /// Register a command. Requires `ui.registerCommand` for the id, and the
    /// id must live in the plugin's own `<plugin>.` namespace.
    pub fn register_command(&self, id: &str, handler: CommandHandler) -> Result<()> {
        let prefix = format!("{}.", self.plugin_id);
        if !id.starts_with(&prefix) || id.len() == prefix.len() {
            return Err(VcpError::Command(format!(
                "command '{id}' must be in the '{prefix}' namespace"
            )));
        }
        if !self.has_permission(UI_REGISTER_COMMAND, id) {
            return Err(VcpError::denied(&self.plugin_id, UI_REGISTER_COMMAND, id));
        }
        self.services
            .commands
            .register(&self.plugin_id, id, handler)?;
        self.tracker.track_command(id);
        Ok(())
    }

    /// Ask the host to show a notification (`system:notification` on the bus).
    pub fn show_notification(&self, title: &str, body: &str) -> Result<()> {
        if !self.has_permission(SYSTEM_NOTIFY, title) {
            return Err(VcpError::denied(&self.plugin_id, SYSTEM_NOTIFY, title));
        }
        debug!(plugin = %self.plugin_id, title, "notification requested");
        self.services.events.emit(
            "system:notification",
            &json!({ "pluginId": self.plugin_id, "title": title, "body": body }),
        );
        Ok(())
    }
}
