use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use vcp_core::{Result, VcpError};

/// A command callback. Receives the invocation arguments, returns a result value.
pub type CommandHandler = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandInfo {
    pub id: String,
    pub plugin_id: String,
}

struct RegisteredCommand {
    plugin_id: String,
    handler: CommandHandler,
}

/// Host-side table of commands contributed by running plugins.
#[derive(Default)]
pub struct CommandRegistry {
    commands: RwLock<HashMap<String, RegisteredCommand>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` for `plugin_id`. Ids are unique across plugins.
    pub fn register(&self, plugin_id: &str, id: &str, handler: CommandHandler) -> Result<()> {
        let mut commands = self.commands.write();
        if let Some(existing) = commands.get(id) {
            return Err(VcpError::Command(format!(
                "command '{id}' is already registered by '{}'",
                existing.plugin_id
            )));
        }
        commands.insert(
            id.to_string(),
            RegisteredCommand {
                plugin_id: plugin_id.to_string(),
                handler,
            },
        );
        info!(plugin = plugin_id, command = id, "command registered");
        Ok(())
    }

    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.commands.write().remove(id).is_some();
        if removed {
            debug!(command = id, "command unregistered");
        }
        removed
    }

    /// Drop every command owned by `plugin_id`.
    pub fn unregister_plugin(&self, plugin_id: &str) -> usize {
        let mut commands = self.commands.write();
        let before = commands.len();
        commands.retain(|_, c| c.plugin_id != plugin_id);
        before - commands.len()
    }

    /// Run a command. The handler is called without holding the table lock,
    /// so it may register or unregister commands itself.
    pub fn execute(&self, id: &str, args: Value) -> Result<Value> {
        let handler = self
            .commands
            .read()
            .get(id)
            .map(|c| Arc::clone(&c.handler))
            .ok_or_else(|| VcpError::Command(format!("unknown command '{id}'")))?;
        debug!(command = id, "executing command");
        handler(args)
    }

    pub fn owner(&self, id: &str) -> Option<String> {
        self.commands.read().get(id).map(|c| c.plugin_id.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.commands.read().contains_key(id)
    }

    /// All commands sorted by id, optionally only one plugin's.
    pub fn list(&self, plugin_id: Option<&str>) -> Vec<CommandInfo> {
        let mut out: Vec<CommandInfo> = self
            .commands
            .read()
            .iter()
            .filter(|(_, c)| plugin_id.is_none_or(|p| p == c.plugin_id))
            .map(|(id, c)| CommandInfo {
                id: id.clone(),
                plugin_id: c.plugin_id.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn len(&self) -> usize {
        self.commands.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
