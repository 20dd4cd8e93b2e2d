use console::style;

use vcp_config::VcpConfig;
use vcp_core::{PermissionSpec, VcpError};
use vcp_plugin::Permission;

use super::{PermissionAction, open_manager};

fn parse(permission: &str) -> vcp_core::Result<PermissionSpec> {
    permission.parse().map_err(VcpError::Config)
}

fn print_grant(grant: &Permission) {
    let scope = grant.scope.as_deref().unwrap_or("*");
    println!(
        "    {:<22} {:<32} {}",
        grant.permission_type,
        scope,
        style(grant.granted_at.format("%Y-%m-%d %H:%M")).dim()
    );
}

pub(super) fn cmd_permission(config: VcpConfig, action: PermissionAction) -> vcp_core::Result<()> {
    let manager = open_manager(config, false)?;
    let pm = manager.permissions();

    match action {
        PermissionAction::List { plugin: Some(plugin) } => {
            let grants = pm.grants_for(&plugin);
            if grants.is_empty() {
                println!("{plugin} holds no grants.");
            } else {
                println!("{}", style(&plugin).bold());
                grants.iter().for_each(print_grant);
            }
        }
        PermissionAction::List { plugin: None } => {
            let all = pm.all_grants();
            if all.is_empty() {
                println!("No grants recorded.");
            }
            for (plugin, grants) in &all {
                println!("{}", style(plugin).bold());
                grants.iter().for_each(print_grant);
            }
        }
        PermissionAction::Grant { plugin, permission } => {
            let spec = parse(&permission)?;
            if pm.grant_spec(&plugin, &spec)? {
                println!("{} Granted {spec} to {plugin}", style("✔").green());
            } else {
                println!("{plugin} already holds {spec}");
            }
        }
        PermissionAction::Revoke { plugin, permission } => {
            let spec = parse(&permission)?;
            if pm.revoke(&plugin, &spec.permission_type(), spec.scope.as_deref())? {
                println!("{} Revoked {spec} from {plugin}", style("✔").green());
            } else {
                println!("{plugin} does not hold {spec}");
            }
        }
        PermissionAction::RevokeAll { plugin } => {
            let n = pm.revoke_all(&plugin)?;
            println!("{} Revoked {n} grant(s) from {plugin}", style("✔").green());
        }
        PermissionAction::Check {
            plugin,
            permission_type,
            resource,
        } => {
            if pm.check(&plugin, &permission_type, &resource) {
                println!("{} {plugin} may {permission_type} {resource}", style("allow").green());
            } else {
                println!("{} {plugin} may not {permission_type} {resource}", style("deny").red());
                std::process::exit(2);
            }
        }
    }
    Ok(())
}
