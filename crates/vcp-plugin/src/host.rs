use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use vcp_core::{EventBus, Result};

use crate::context::PluginContext;
use crate::manifest::PluginManifest;
use crate::registry::PluginMetadata;

/// A loaded plugin instance.
///
/// Hooks only ever see the [`PluginContext`] for their own plugin id. Anything
/// registered through it during `activate` is torn down by the manager after
/// `deactivate` returns, so `deactivate` only needs to release state the
/// plugin holds itself.
#[async_trait]
pub trait Plugin: Send + Sync {
    async fn activate(&self, ctx: &PluginContext) -> Result<()>;

    async fn deactivate(&self, _ctx: &PluginContext) -> Result<()> {
        Ok(())
    }
}

/// Turns an installed package into a runnable [`Plugin`].
pub trait PluginLoader: Send + Sync {
    fn load(&self, metadata: &PluginMetadata) -> Result<Arc<dyn Plugin>>;
}

/// Plugin with no code of its own: it registers the commands its manifest
/// contributes. Running one emits `<plugin>:<command>` with the arguments as
/// payload and returns them.
pub struct DeclarativePlugin {
    manifest: PluginManifest,
    events: EventBus,
}

impl DeclarativePlugin {
    pub fn new(manifest: PluginManifest, events: EventBus) -> Self {
        Self { manifest, events }
    }
}

#[async_trait]
impl Plugin for DeclarativePlugin {
    async fn activate(&self, ctx: &PluginContext) -> Result<()> {
        for command in &self.manifest.contributes.commands {
            let event = format!("{}:{}", self.manifest.name, command.command_name());
            let events = self.events.clone();
            ctx.register_command(
                &command.identifier,
                Arc::new(move |args: Value| {
                    let delivered = events.emit(&event, &args);
                    Ok(json!({ "event": event, "delivered": delivered, "args": args }))
                }),
            )?;
        }
        debug!(
            plugin = %self.manifest.name,
            commands = self.manifest.contributes.commands.len(),
            "declarative plugin activated"
        );
        Ok(())
    }
}

pub struct DeclarativeLoader {
    events: EventBus,
}

impl DeclarativeLoader {
    pub fn new(events: EventBus) -> Self {
        Self { events }
    }
}

impl PluginLoader for DeclarativeLoader {
    fn load(&self, metadata: &PluginMetadata) -> Result<Arc<dyn Plugin>> {
        Ok(Arc::new(DeclarativePlugin::new(
            metadata.manifest.clone(),
            self.events.clone(),
        )))
    }
}

/// In-process plugins registered by name, falling back to another loader
/// (usually [`DeclarativeLoader`]) for everything else.
pub struct StaticLoader {
    plugins: RwLock<HashMap<String, Arc<dyn Plugin>>>,
    fallback: Box<dyn PluginLoader>,
}

impl StaticLoader {
    pub fn new(fallback: Box<dyn PluginLoader>) -> Self {
        Self {
            plugins: RwLock::new(HashMap::new()),
            fallback,
        }
    }

    pub fn register(&self, name: &str, plugin: Arc<dyn Plugin>) {
        self.plugins.write().insert(name.to_string(), plugin);
    }
}

impl PluginLoader for StaticLoader {
    fn load(&self, metadata: &PluginMetadata) -> Result<Arc<dyn Plugin>> {
        if let Some(plugin) = self.plugins.read().get(&metadata.id) {
            return Ok(Arc::clone(plugin));
        }
        self.fallback.load(metadata)
    }
}
