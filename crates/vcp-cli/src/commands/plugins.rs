use console::style;

use vcp_config::VcpConfig;
use vcp_core::{PermissionSpec, VcpError};
use vcp_plugin::PluginManager;

use super::{PluginAction, open_manager};

pub(super) async fn cmd_plugin(config: VcpConfig, action: PluginAction) -> vcp_core::Result<()> {
    let auto_approve = matches!(action, PluginAction::Activate { yes: true, .. });
    let manager = open_manager(config, auto_approve)?;

    match action {
        PluginAction::List => {
            let plugins = manager.list();
            if plugins.is_empty() {
                println!("No plugins installed.");
            }
            for p in plugins {
                let name = if p.manifest.display_name.is_empty() {
                    p.id.clone()
                } else {
                    format!("{} ({})", p.manifest.display_name, p.id)
                };
                println!("  {} v{}  {}", style(name).bold(), p.manifest.version, p.manifest.description);
            }
        }
        PluginAction::Info { name } => print_info(&manager, &name)?,
        PluginAction::Install { path } => {
            let id = manager.install_from_path(&path).await?;
            let manifest = manager
                .get(&id)
                .map(|m| m.manifest)
                .ok_or_else(|| VcpError::PluginNotFound(id.clone()))?;
            println!("{} Installed {id} v{}", style("✔").green(), manifest.version);
            if !manifest.permissions.is_empty() {
                println!("  Requests on activation:");
                for p in &manifest.permissions {
                    println!("    {p}");
                }
            }
        }
        PluginAction::Uninstall { name } => {
            manager.uninstall(&name).await?;
            println!("{} Uninstalled {name}", style("✔").green());
        }
        PluginAction::Activate { name, .. } => {
            let activated = manager.activate_with_dependencies(&name).await;
            // Activation state is per process; stop everything cleanly either way.
            manager.shutdown().await;
            let order = activated?;
            println!(
                "{} {name} activates cleanly (order: {})",
                style("✔").green(),
                order.join(" -> ")
            );
        }
        PluginAction::Resolve { names } => {
            for (i, id) in manager.resolve_dependencies(&names)?.iter().enumerate() {
                println!("  {}. {id}", i + 1);
            }
        }
    }
    Ok(())
}

fn print_info(manager: &PluginManager, name: &str) -> vcp_core::Result<()> {
    let meta = manager
        .get(name)
        .ok_or_else(|| VcpError::PluginNotFound(name.to_string()))?;
    let m = &meta.manifest;

    println!("{} v{}", style(&m.name).bold(), m.version);
    if !m.description.is_empty() {
        println!("  {}", m.description);
    }
    if !m.author.is_empty() {
        println!("  Author: {}", m.author);
    }
    println!("  State: {}", meta.state);
    println!("  Path: {}", meta.install_path.display());
    if let Some(range) = &m.engines.vcp {
        println!("  Requires vcp: {range}");
    }
    if let Some(checksum) = &m.checksum {
        println!("  Checksum: {}", checksum.chars().take(16).collect::<String>());
    }

    if !m.dependencies.is_empty() {
        println!("\n  {}", style("Dependencies:").bold());
        for (dep, range) in &m.dependencies {
            let state = manager
                .state(dep)
                .map(|s| s.to_string())
                .unwrap_or_else(|| "not installed".to_string());
            println!("    {dep} {range} [{state}]");
        }
    }

    if !m.contributes.commands.is_empty() {
        println!("\n  {}", style(format!("Commands ({}):", m.contributes.commands.len())).bold());
        for c in &m.contributes.commands {
            println!("    {}  {}", c.identifier, c.title);
        }
    }

    let pm = manager.permissions();
    println!("\n  {}", style("Permissions:").bold());
    let declared: Vec<PermissionSpec> = m.permission_specs();
    for spec in &declared {
        let mark = if pm.is_granted(name, &spec.permission_type(), spec.scope.as_deref()) {
            style("granted").green()
        } else {
            style("pending").yellow()
        };
        println!("    {spec} [{mark}]");
    }
    let extra: Vec<_> = pm
        .grants_for(name)
        .into_iter()
        .filter(|g| {
            !declared
                .iter()
                .any(|d| d.permission_type() == g.permission_type && d.scope == g.scope)
        })
        .collect();
    for g in &extra {
        let scope = g.scope.as_deref().map(|s| format!(":{s}")).unwrap_or_default();
        println!("    {}{scope} [{}]", g.permission_type, style("granted manually").cyan());
    }
    if declared.is_empty() && extra.is_empty() {
        println!("    none");
    }
    Ok(())
}
