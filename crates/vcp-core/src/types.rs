use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Unique identifier for a plugin (its manifest `name`).
pub type PluginId = String;

// ── Lifecycle ──────────────────────────────────────────────────

/// Where a plugin sits in its lifecycle.
///
/// `Deactivated` is transient: a deactivated plugin immediately collapses back
/// to `Installed` and can be activated again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Uninstalled,
    Installed,
    Loaded,
    Activated,
    Running,
    Deactivated,
}

impl PluginState {
    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// `Loaded -> Installed` and `Activated -> Installed` are the revert edges
    /// taken when activation fails part-way.
    pub fn can_transition_to(self, next: PluginState) -> bool {
        use PluginState::*;
        matches!(
            (self, next),
            (Uninstalled, Installed)
                | (Installed, Loaded)
                | (Loaded, Activated)
                | (Activated, Running)
                | (Running, Deactivated)
                | (Deactivated, Installed)
                | (Installed, Uninstalled)
                | (Loaded, Installed)
                | (Activated, Installed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PluginState::Uninstalled => "uninstalled",
            PluginState::Installed => "installed",
            PluginState::Loaded => "loaded",
            PluginState::Activated => "activated",
            PluginState::Running => "running",
            PluginState::Deactivated => "deactivated",
        }
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Permissions ────────────────────────────────────────────────

/// The resource family a permission applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionKind {
    Filesystem,
    Network,
    Storage,
    System,
    Ui,
}

impl PermissionKind {
    pub const ALL: [PermissionKind; 5] = [
        PermissionKind::Filesystem,
        PermissionKind::Network,
        PermissionKind::Storage,
        PermissionKind::System,
        PermissionKind::Ui,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PermissionKind::Filesystem => "filesystem",
            PermissionKind::Network => "network",
            PermissionKind::Storage => "storage",
            PermissionKind::System => "system",
            PermissionKind::Ui => "ui",
        }
    }
}

impl fmt::Display for PermissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PermissionKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| {
                format!(
                    "unknown permission type '{s}' (expected one of filesystem, network, storage, system, ui)"
                )
            })
    }
}

/// A parsed permission string of the form `type.action[:scope]`.
///
/// ```
/// use vcp_core::PermissionSpec;
///
/// let spec: PermissionSpec = "network.request:*.example.com".parse().unwrap();
/// assert_eq!(spec.permission_type(), "network.request");
/// assert_eq!(spec.scope.as_deref(), Some("*.example.com"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PermissionSpec {
    pub kind: PermissionKind,
    pub action: String,
    pub scope: Option<String>,
}

impl PermissionSpec {
    pub fn new(kind: PermissionKind, action: impl Into<String>, scope: Option<String>) -> Self {
        Self {
            kind,
            action: action.into(),
            scope,
        }
    }

    /// The `type.action` key grants are stored under.
    pub fn permission_type(&self) -> String {
        format!("{}.{}", self.kind, self.action)
    }
}

impl FromStr for PermissionSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (head, scope) = match s.split_once(':') {
            Some((head, scope)) => (head, Some(scope)),
            None => (s, None),
        };

        let (kind, action) = head
            .split_once('.')
            .ok_or_else(|| format!("permission '{s}' must have the form type.action[:scope]"))?;
        let kind: PermissionKind = kind.parse()?;

        let mut chars = action.chars();
        let starts_alpha = chars.next().is_some_and(|c| c.is_ascii_alphabetic());
        if !starts_alpha || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(format!("permission '{s}' has an invalid action '{action}'"));
        }

        let scope = match scope {
            None => None,
            Some("") => return Err(format!("permission '{s}' has an empty scope")),
            Some(scope) if scope.chars().any(|c| c.is_whitespace() || c.is_control()) => {
                return Err(format!("permission '{s}' scope contains whitespace"));
            }
            Some(scope) => Some(scope.to_string()),
        };

        Ok(Self {
            kind,
            action: action.to_string(),
            scope,
        })
    }
}

impl fmt::Display for PermissionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.action)?;
        if let Some(scope) = &self.scope {
            write!(f, ":{scope}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_scoped_permission() {
        let spec: PermissionSpec = "filesystem.read:AppData/my-plugin/*".parse().unwrap();
        assert_eq!(spec.kind, PermissionKind::Filesystem);
        assert_eq!(spec.action, "read");
        assert_eq!(spec.scope.as_deref(), Some("AppData/my-plugin/*"));
        assert_eq!(spec.to_string(), "filesystem.read:AppData/my-plugin/*");
    }

    #[test]
    fn test_parses_unscoped_permission() {
        let spec: PermissionSpec = "ui.registerCommand".parse().unwrap();
        assert_eq!(spec.kind, PermissionKind::Ui);
        assert_eq!(spec.permission_type(), "ui.registerCommand");
        assert!(spec.scope.is_none());
    }

    #[test]
    fn test_rejects_malformed_permissions() {
        assert!("filesystem".parse::<PermissionSpec>().is_err());
        assert!("shell.exec".parse::<PermissionSpec>().is_err());
        assert!("network.:x".parse::<PermissionSpec>().is_err());
        assert!("network.request:".parse::<PermissionSpec>().is_err());
        assert!("network.request:a b".parse::<PermissionSpec>().is_err());
        assert!("network.1request".parse::<PermissionSpec>().is_err());
    }

    #[test]
    fn test_lifecycle_edges() {
        use PluginState::*;
        assert!(Uninstalled.can_transition_to(Installed));
        assert!(Running.can_transition_to(Deactivated));
        assert!(Deactivated.can_transition_to(Installed));
        assert!(!Installed.can_transition_to(Running));
        assert!(!Running.can_transition_to(Uninstalled));
        assert!(!Uninstalled.can_transition_to(Running));
    }
}
