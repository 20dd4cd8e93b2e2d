use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::schema::VcpConfig;

/// Loads the trust-core configuration and keeps a shared, reloadable copy.
pub struct ConfigLoader {
    config: Arc<RwLock<VcpConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > VCP_CONFIG env > ~/.vcp/vcp.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("VCP_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".vcp")
            .join("vcp.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> vcp_core::Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            let raw = std::fs::read_to_string(&config_path)?;
            Self::parse(&raw, &config_path)?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            VcpConfig::default()
        };

        let config = Self::apply_env_overrides(config, |key| std::env::var(key).ok());
        Self::check(&config)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Build a loader around an already-constructed config (embedding hosts, tests).
    pub fn from_config(config: VcpConfig, config_path: PathBuf) -> vcp_core::Result<Self> {
        Self::check(&config)?;
        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> VcpConfig {
        self.config.read().clone()
    }

    /// Get a shared reference for subscription.
    pub fn shared(&self) -> Arc<RwLock<VcpConfig>> {
        Arc::clone(&self.config)
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Reload the config from disk. The current config is kept if the new one
    /// fails to parse or validate.
    pub fn reload(&self) -> vcp_core::Result<()> {
        if !self.config_path.exists() {
            return Err(vcp_core::VcpError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let raw = std::fs::read_to_string(&self.config_path)?;
        let new_config = Self::parse(&raw, &self.config_path)?;
        let new_config = Self::apply_env_overrides(new_config, |key| std::env::var(key).ok());
        Self::check(&new_config)?;
        *self.config.write() = new_config;
        info!("configuration reloaded");
        Ok(())
    }

    /// Apply overrides (VCP_DATA_DIR, VCP_LOG_LEVEL, VCP_AUTH_POLICY,
    /// VCP_NETWORK_MAX_TIMEOUT) looked up through `lookup`.
    pub fn apply_env_overrides<F>(mut config: VcpConfig, lookup: F) -> VcpConfig
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("VCP_DATA_DIR") {
            config.paths.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("VCP_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Some(v) = lookup("VCP_AUTH_POLICY") {
            config.permissions.policy = v;
        }
        if let Some(v) = lookup("VCP_NETWORK_MAX_TIMEOUT") {
            match v.parse::<u64>() {
                Ok(secs) => config.network.max_timeout_secs = secs,
                Err(_) => warn!(value = %v, "ignoring non-numeric VCP_NETWORK_MAX_TIMEOUT"),
            }
        }
        config
    }

    fn parse(raw: &str, origin: &Path) -> vcp_core::Result<VcpConfig> {
        toml::from_str::<VcpConfig>(raw).map_err(|e| {
            vcp_core::VcpError::Config(format!("failed to parse {}: {}", origin.display(), e))
        })
    }

    /// Log warnings, fail on errors.
    fn check(config: &VcpConfig) -> vcp_core::Result<()> {
        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
                Ok(())
            }
            Err(e) => Err(vcp_core::VcpError::Config(e)),
        }
    }
}
