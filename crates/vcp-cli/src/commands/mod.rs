use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use vcp_config::{ConfigLoader, VcpConfig};
use vcp_core::VcpError;
use vcp_plugin::{AlwaysApprove, AuditLogger, AuthorizationPolicy, PluginManager, policy_from_config};

mod permissions;
mod plugins;
mod prompt;

pub use prompt::PromptPolicy;

/// VCP plugin trust core: manifests, permissions and plugin lifecycle
#[derive(Parser)]
#[command(name = "vcp", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to vcp.toml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage plugins
    Plugin {
        #[command(subcommand)]
        action: PluginAction,
    },
    /// Inspect and edit permission grants
    Permission {
        #[command(subcommand)]
        action: PermissionAction,
    },
    /// Show recent audit log entries
    Logs {
        /// Number of entries to show (default 50)
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,

        /// Only show entries for this plugin
        #[arg(short, long)]
        plugin: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show current configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum PluginAction {
    /// List installed plugins
    List,
    /// Show manifest details and grants of an installed plugin
    Info { name: String },
    /// Install a plugin from a .zip package or an unpacked directory
    Install { path: PathBuf },
    /// Uninstall a plugin and delete its grants and private storage
    Uninstall { name: String },
    /// Activate a plugin (and its dependencies), asking for missing permissions
    Activate {
        name: String,
        /// Approve every permission request without prompting
        #[arg(short, long)]
        yes: bool,
    },
    /// Print the dependency-first activation order for the given plugins
    Resolve {
        #[arg(required = true)]
        names: Vec<String>,
    },
}

#[derive(Subcommand)]
enum PermissionAction {
    /// List grants, optionally for one plugin
    List { plugin: Option<String> },
    /// Grant a permission, e.g. `network.request:*.example.com`
    Grant { plugin: String, permission: String },
    /// Revoke a single grant
    Revoke { plugin: String, permission: String },
    /// Revoke every grant a plugin holds
    RevokeAll { plugin: String },
    /// Check whether a plugin may perform an action on a resource
    Check {
        plugin: String,
        /// Permission type, e.g. `filesystem.read`
        permission_type: String,
        resource: String,
    },
}

impl Cli {
    pub async fn run(self) -> vcp_core::Result<()> {
        // Load config first so we can use it for log format
        let config_loader = ConfigLoader::load(self.config.as_deref())?;
        let config = config_loader.get();

        // Resolve log level: --verbose > --quiet > --log-level > config
        let log_level = if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            self.log_level.as_deref().unwrap_or(&config.logging.level)
        };
        init_tracing(&config, log_level);

        match self.command {
            Commands::Plugin { action } => plugins::cmd_plugin(config, action).await,
            Commands::Permission { action } => permissions::cmd_permission(config, action),
            Commands::Logs { limit, plugin, json } => Self::cmd_logs(config, limit, plugin, json),
            Commands::Config { json } => Self::cmd_config(config, json),
        }
    }

    fn cmd_config(config: VcpConfig, json: bool) -> vcp_core::Result<()> {
        let rendered = if json {
            serde_json::to_string_pretty(&config)?
        } else {
            toml::to_string_pretty(&config).map_err(|e| VcpError::Config(e.to_string()))?
        };
        println!("{rendered}");

        match config.validate() {
            Ok(warnings) => {
                for w in warnings {
                    eprintln!("{} {}: {}", style("warning:").yellow(), w.field, w.message);
                }
            }
            Err(e) => eprintln!("{} {e}", style("error:").red()),
        }
        Ok(())
    }

    fn cmd_logs(
        config: VcpConfig,
        limit: usize,
        plugin: Option<String>,
        json: bool,
    ) -> vcp_core::Result<()> {
        let audit = AuditLogger::open(&config.paths.audit_dir())?;
        let entries = audit.recent(limit, plugin.as_deref())?;

        if json {
            println!("{}", serde_json::to_string_pretty(&entries)?);
            return Ok(());
        }
        if entries.is_empty() {
            println!("No audit log entries.");
            return Ok(());
        }

        for e in entries {
            let verdict = if e.allowed {
                style("allow").green()
            } else {
                style("deny ").red()
            };
            let detail = e.detail.map(|d| format!(" ({d})")).unwrap_or_default();
            println!(
                "{} {verdict} {:<16} {:<24} {}{detail}",
                e.timestamp.format("%Y-%m-%d %H:%M:%S"),
                e.plugin_id,
                e.action,
                e.resource,
            );
        }
        Ok(())
    }
}

fn init_tracing(config: &VcpConfig, log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    // Diagnostics never go to stdout; command output stays pipeable.
    let writer = match &config.logging.file {
        Some(path) => match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => BoxMakeWriter::new(Mutex::new(file)),
            Err(e) => {
                eprintln!("{} cannot open log file {}: {e}", style("warning:").yellow(), path.display());
                BoxMakeWriter::new(std::io::stderr)
            }
        },
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(writer);
    match config.logging.format.as_str() {
        "json" => builder.json().with_target(true).init(),
        "compact" => builder.compact().with_target(false).init(),
        _ => builder.with_target(false).init(),
    }
}

/// Build a manager over the configured directories and load what is installed.
///
/// `auto_approve` swaps the configured policy for [`AlwaysApprove`].
fn open_manager(config: VcpConfig, auto_approve: bool) -> vcp_core::Result<PluginManager> {
    let policy: Arc<dyn AuthorizationPolicy> = if auto_approve {
        Arc::new(AlwaysApprove)
    } else {
        policy_from_config(&config.permissions, Some(Arc::new(PromptPolicy::new())))?
    };
    let manager = PluginManager::builder(config).policy(policy).build()?;
    manager.discover()?;
    Ok(manager)
}
