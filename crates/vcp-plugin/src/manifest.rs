use regex::Regex;
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path};
use std::sync::LazyLock;

use vcp_core::{PermissionSpec, Result, VcpError};

/// Manifests larger than this are rejected before parsing.
pub const MAX_MANIFEST_BYTES: usize = 64 * 1024;

/// Manifest file name expected at the package root.
pub const MANIFEST_FILE: &str = "manifest.json";

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-z0-9-]+$").unwrap());
static COMMAND_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$").unwrap());
static ACTIVATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\*|on[A-Z][A-Za-z]*(:\S+)?)$").unwrap());

/// Plugin manifest, parsed from `manifest.json` at the package root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    pub manifest_version: String,
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    /// Entry file, relative to the package root.
    pub main: String,
    #[serde(default)]
    pub activation_events: Vec<String>,
    /// Permission strings of the form `type.action[:scope]`.
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub contributes: Contributions,
    /// Dependency name → semver range.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub engines: Engines,
    /// BLAKE3 hash of the `main` file for integrity verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Things the plugin adds to the host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Contributions {
    #[serde(default)]
    pub commands: Vec<CommandContribution>,
    #[serde(default)]
    pub views: Vec<serde_json::Value>,
    #[serde(default)]
    pub events: Vec<serde_json::Value>,
    #[serde(default)]
    pub keybindings: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandContribution {
    /// `<pluginName>.<commandName>`
    pub identifier: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
}

impl CommandContribution {
    /// The part after `<pluginName>.`.
    pub fn command_name(&self) -> &str {
        self.identifier
            .split_once('.')
            .map_or(self.identifier.as_str(), |(_, name)| name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Engines {
    /// Host versions this plugin supports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vcp: Option<String>,
}

/// Parse and validate a manifest. Any violation aborts with
/// `ManifestValidation`, so callers never see a half-valid manifest.
pub fn parse_manifest(bytes: &[u8]) -> Result<PluginManifest> {
    PluginManifest::parse(bytes)
}

fn invalid(reason: impl Into<String>) -> VcpError {
    VcpError::ManifestValidation(reason.into())
}

impl PluginManifest {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_MANIFEST_BYTES {
            return Err(invalid(format!(
                "manifest is {} bytes (limit {})",
                bytes.len(),
                MAX_MANIFEST_BYTES
            )));
        }
        let manifest: PluginManifest =
            serde_json::from_slice(bytes).map_err(|e| invalid(format!("invalid JSON: {e}")))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::parse(&bytes)
    }

    /// Field-level validation. Dependency *graph* checks (cycles, missing
    /// plugins) happen at resolution time, when all manifests are visible.
    pub fn validate(&self) -> Result<()> {
        let manifest_version = Version::parse(&self.manifest_version).map_err(|e| {
            invalid(format!(
                "manifestVersion '{}' is not semver: {e}",
                self.manifest_version
            ))
        })?;
        if manifest_version.major != 1 {
            return Err(invalid(format!(
                "unsupported manifestVersion '{}' (expected 1.x)",
                self.manifest_version
            )));
        }

        if !NAME_RE.is_match(&self.name) {
            return Err(invalid(format!(
                "name '{}' must match ^[a-z0-9-]+$",
                self.name
            )));
        }

        Version::parse(&self.version)
            .map_err(|e| invalid(format!("version '{}' is not semver: {e}", self.version)))?;

        self.validate_main()?;
        self.validate_permissions()?;
        self.validate_commands()?;

        for event in &self.activation_events {
            if !ACTIVATION_RE.is_match(event) {
                return Err(invalid(format!("malformed activation event '{event}'")));
            }
        }

        for (dep, range) in &self.dependencies {
            if !NAME_RE.is_match(dep) {
                return Err(invalid(format!("dependency name '{dep}' is malformed")));
            }
            if dep == &self.name {
                return Err(invalid(format!("plugin '{}' depends on itself", self.name)));
            }
            VersionReq::parse(range).map_err(|e| {
                invalid(format!("dependency '{dep}' has invalid range '{range}': {e}"))
            })?;
        }

        if let Some(range) = &self.engines.vcp {
            VersionReq::parse(range)
                .map_err(|e| invalid(format!("engines.vcp '{range}' is not a semver range: {e}")))?;
        }

        if let Some(checksum) = &self.checksum
            && (checksum.len() != 64 || !checksum.chars().all(|c| c.is_ascii_hexdigit()))
        {
            return Err(invalid("checksum must be a 64-character BLAKE3 hex digest"));
        }

        Ok(())
    }

    fn validate_main(&self) -> Result<()> {
        let main = Path::new(&self.main);
        if self.main.trim().is_empty() {
            return Err(invalid("main must not be empty"));
        }
        let escapes = main
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(invalid(format!(
                "main '{}' must be a relative path inside the package",
                self.main
            )));
        }
        Ok(())
    }

    fn validate_permissions(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for raw in &self.permissions {
            raw.parse::<PermissionSpec>().map_err(invalid)?;
            if !seen.insert(raw) {
                return Err(invalid(format!("duplicate permission '{raw}'")));
            }
        }
        Ok(())
    }

    fn validate_commands(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for command in &self.contributes.commands {
            let id = &command.identifier;
            let well_formed = id
                .split_once('.')
                .is_some_and(|(plugin, name)| plugin == self.name && COMMAND_NAME_RE.is_match(name));
            if !well_formed {
                return Err(invalid(format!(
                    "command identifier '{id}' must be '{}.<commandName>'",
                    self.name
                )));
            }
            if !seen.insert(id) {
                return Err(invalid(format!("duplicate command identifier '{id}'")));
            }
        }
        Ok(())
    }

    /// Get the semver version.
    pub fn semver(&self) -> Option<Version> {
        Version::parse(&self.version).ok()
    }

    /// Parsed permission declarations. Only meaningful on a validated manifest;
    /// malformed entries are skipped.
    pub fn permission_specs(&self) -> Vec<PermissionSpec> {
        self.permissions
            .iter()
            .filter_map(|p| p.parse().ok())
            .collect()
    }

    /// Whether `engines.vcp` admits the given host version. No range = any host.
    pub fn is_compatible_with(&self, host: &Version) -> bool {
        match &self.engines.vcp {
            Some(range) => VersionReq::parse(range).is_ok_and(|req| req.matches(host)),
            None => true,
        }
    }

    /// Verify the entry file integrity.
    pub fn verify_checksum(&self, main_bytes: &[u8]) -> bool {
        match &self.checksum {
            Some(expected) => {
                let actual = blake3::hash(main_bytes).to_hex().to_string();
                actual.eq_ignore_ascii_case(expected)
            }
            None => true, // No checksum = no verification
        }
    }
}
