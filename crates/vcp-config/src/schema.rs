use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration, mapped from `vcp.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VcpConfig {
    pub paths: PathsConfig,
    pub network: NetworkConfig,
    pub permissions: PermissionsConfig,
    pub host: HostConfig,
    pub logging: LoggingConfig,
}

// ── Paths ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Application-private root. Everything else defaults to a child of it.
    pub data_dir: PathBuf,
    /// Installed plugin packages (one directory per plugin).
    pub plugin_dir: Option<PathBuf>,
    /// Per-plugin private storage; plugins see it as `AppData/<plugin>/`.
    pub storage_dir: Option<PathBuf>,
    /// Persisted permission grants.
    pub permissions_file: Option<PathBuf>,
    /// Daily JSONL audit files.
    pub audit_dir: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".vcp"),
            plugin_dir: None,
            storage_dir: None,
            permissions_file: None,
            audit_dir: None,
        }
    }
}

impl PathsConfig {
    pub fn plugin_dir(&self) -> PathBuf {
        self.plugin_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("plugins"))
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.storage_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("AppData"))
    }

    pub fn permissions_file(&self) -> PathBuf {
        self.permissions_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("permissions.json"))
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.audit_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("audit"))
    }
}

// ── Network ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Timeout applied when a request does not set one.
    pub default_timeout_secs: u64,
    /// Upper bound; larger requested timeouts are clamped to this.
    pub max_timeout_secs: u64,
    /// Token-bucket capacity per plugin.
    pub rate_limit_burst: u32,
    /// Tokens refilled per second per plugin.
    pub rate_limit_refill_per_sec: f64,
    /// How long a cached GET response stays fresh, unless the response says otherwise.
    pub cache_ttl_secs: u64,
    /// Maximum number of cached responses.
    pub cache_max_entries: usize,
    pub user_agent: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 30,
            max_timeout_secs: 300,
            rate_limit_burst: 60,
            rate_limit_refill_per_sec: 10.0,
            cache_ttl_secs: 300,
            cache_max_entries: 512,
            user_agent: format!("vcp-plugin-proxy/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

// ── Permissions ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    /// Authorization policy: "deny", "approve", "allowlist", or "prompt".
    pub policy: String,
    /// `type.action` patterns approved by the allowlist policy (e.g. "ui.*").
    pub auto_approve: Vec<String>,
    /// Seconds an interactive or channel-backed approval may take before it counts as denied.
    pub approval_timeout_secs: u64,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            policy: "deny".into(),
            auto_approve: vec![],
            approval_timeout_secs: 120,
        }
    }
}

// ── Host ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Host version checked against each manifest's `engines.vcp` range.
    pub version: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty", "json", "compact".
    pub format: String,
    /// Log file path (None = stderr only).
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
            file: None,
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let icon = match self.severity {
            WarningSeverity::Error => "❌",
            WarningSeverity::Warning => "⚠️ ",
            WarningSeverity::Info => "💡",
        };
        write!(f, "{} {}: {}", icon, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, "\n   ↳ {}", h)?;
        }
        Ok(())
    }
}

pub const VALID_POLICIES: [&str; 4] = ["deny", "approve", "allowlist", "prompt"];

impl VcpConfig {
    /// Validate the config and return a list of warnings/errors.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        // ── Timeouts ───
        if self.network.max_timeout_secs == 0 {
            warnings.push(ConfigWarning {
                field: "network.max_timeout_secs".into(),
                message: "maximum timeout is 0, every request would time out immediately".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 300".into()),
            });
        }
        if self.network.default_timeout_secs == 0 {
            warnings.push(ConfigWarning {
                field: "network.default_timeout_secs".into(),
                message: "default timeout is 0".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 30".into()),
            });
        } else if self.network.default_timeout_secs > self.network.max_timeout_secs {
            warnings.push(ConfigWarning {
                field: "network.default_timeout_secs".into(),
                message: format!(
                    "default timeout {}s exceeds the maximum {}s",
                    self.network.default_timeout_secs, self.network.max_timeout_secs
                ),
                severity: WarningSeverity::Error,
                hint: Some("The default must not be larger than max_timeout_secs".into()),
            });
        }

        // ── Rate limiting ───
        if self.network.rate_limit_burst == 0 {
            warnings.push(ConfigWarning {
                field: "network.rate_limit_burst".into(),
                message: "burst is 0, plugins can never make a request".into(),
                severity: WarningSeverity::Warning,
                hint: Some("Set to e.g. 60".into()),
            });
        }
        if !self.network.rate_limit_refill_per_sec.is_finite() {
            warnings.push(ConfigWarning {
                field: "network.rate_limit_refill_per_sec".into(),
                message: format!(
                    "refill rate {} is not a finite number",
                    self.network.rate_limit_refill_per_sec
                ),
                severity: WarningSeverity::Error,
                hint: Some("Use a positive rate such as 10.0".into()),
            });
        } else if self.network.rate_limit_refill_per_sec < 0.0 {
            warnings.push(ConfigWarning {
                field: "network.rate_limit_refill_per_sec".into(),
                message: "refill rate is negative".into(),
                severity: WarningSeverity::Error,
                hint: Some("Use 0 to disable refill, or a positive rate".into()),
            });
        } else if self.network.rate_limit_refill_per_sec == 0.0 {
            warnings.push(ConfigWarning {
                field: "network.rate_limit_refill_per_sec".into(),
                message: "refill rate is 0, buckets never refill".into(),
                severity: WarningSeverity::Warning,
                hint: None,
            });
        }

        // ── Cache ───
        if self.network.cache_max_entries == 0 {
            warnings.push(ConfigWarning {
                field: "network.cache_max_entries".into(),
                message: "cache capacity is 0".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 512, or cache_ttl_secs = 0 to disable caching".into()),
            });
        }

        // ── Authorization policy ───
        let policy = self.permissions.policy.as_str();
        if !VALID_POLICIES.contains(&policy) {
            warnings.push(ConfigWarning {
                field: "permissions.policy".into(),
                message: format!("unknown policy '{}'", policy),
                severity: WarningSeverity::Error,
                hint: Some(format!("Valid values: {}", VALID_POLICIES.join(", "))),
            });
        } else if policy == "approve" {
            warnings.push(ConfigWarning {
                field: "permissions.policy".into(),
                message: "every permission request is approved automatically".into(),
                severity: WarningSeverity::Warning,
                hint: Some("Use 'prompt' or 'allowlist' outside development".into()),
            });
        } else if policy == "allowlist" && self.permissions.auto_approve.is_empty() {
            warnings.push(ConfigWarning {
                field: "permissions.auto_approve".into(),
                message: "allowlist policy with an empty list denies everything".into(),
                severity: WarningSeverity::Info,
                hint: None,
            });
        }

        // ── Host version ───
        if semver::Version::parse(&self.host.version).is_err() {
            warnings.push(ConfigWarning {
                field: "host.version".into(),
                message: format!("'{}' is not a valid semver version", self.host.version),
                severity: WarningSeverity::Error,
                hint: Some("Use e.g. '1.0.0'".into()),
            });
        }

        // ── Logging format ───
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_formats.join(", "))),
            });
        }

        // ── Logging level ───
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_levels.join(", "))),
            });
        }

        // Check for hard errors
        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  • {}", errors.join("\n  • ")));
        }

        Ok(warnings)
    }
}
