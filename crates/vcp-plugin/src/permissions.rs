//! Deny-by-default permission store.
//!
//! Grants are `(plugin, type.action, scope)` triples persisted as JSON
//! (`plugin_id → [{type, scope, granted_at}]`) and rewritten atomically on
//! every change. `check` consults only stored grants and audits every call.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use vcp_core::{PermissionKind, PermissionSpec, Result, VcpError};

use crate::audit::AuditLogger;
use crate::policy::{AuthorizationPolicy, AuthorizationRequest};

/// Virtual prefix under which plugin-private storage is addressed in
/// filesystem scopes (`AppData/<plugin>/...`).
pub const STORAGE_PREFIX: &str = "AppData";

/// A stored grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    #[serde(skip)]
    pub plugin_id: String,
    #[serde(rename = "type")]
    pub permission_type: String,
    pub scope: Option<String>,
    pub granted_at: DateTime<Utc>,
}

impl Permission {
    fn matches(&self, permission_type: &str, scope: Option<&str>) -> bool {
        self.permission_type == permission_type && self.scope.as_deref() == scope
    }

    pub fn display(&self) -> String {
        match &self.scope {
            Some(scope) => format!("{}:{}", self.permission_type, scope),
            None => self.permission_type.clone(),
        }
    }
}

pub struct PermissionManager {
    store_path: Option<PathBuf>,
    /// Canonical on-disk directory that `AppData/` maps to.
    storage_root: Option<PathBuf>,
    grants: RwLock<HashMap<String, Vec<Permission>>>,
    /// Serializes snapshot writes; never held together with `grants`' write lock.
    persist_lock: Mutex<()>,
    audit: Arc<AuditLogger>,
    policy: Arc<dyn AuthorizationPolicy>,
}

impl PermissionManager {
    /// Open the persisted store at `store_path`, creating it on first write.
    pub fn open(
        store_path: &Path,
        storage_root: &Path,
        audit: Arc<AuditLogger>,
        policy: Arc<dyn AuthorizationPolicy>,
    ) -> Result<Self> {
        let grants = load_store(store_path)?;
        let count: usize = grants.values().map(Vec::len).sum();
        info!(path = ?store_path, plugins = grants.len(), grants = count, "permission store loaded");
        Ok(Self {
            store_path: Some(store_path.to_path_buf()),
            storage_root: Some(canonical_root(storage_root)?),
            grants: RwLock::new(grants),
            persist_lock: Mutex::new(()),
            audit,
            policy,
        })
    }

    /// A store that is never written to disk.
    pub fn in_memory(
        storage_root: Option<&Path>,
        audit: Arc<AuditLogger>,
        policy: Arc<dyn AuthorizationPolicy>,
    ) -> Result<Self> {
        Ok(Self {
            store_path: None,
            storage_root: storage_root.map(canonical_root).transpose()?,
            grants: RwLock::new(HashMap::new()),
            persist_lock: Mutex::new(()),
            audit,
            policy,
        })
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    pub fn policy_name(&self) -> &str {
        self.policy.name()
    }

    /// Add a grant. Granting the same triple twice stores it once.
    /// Returns whether a new grant was added.
    pub fn grant(&self, plugin_id: &str, permission_type: &str, scope: Option<&str>) -> Result<bool> {
        validate_permission_type(permission_type)?;

        {
            let mut grants = self.grants.write();
            let list = grants.entry(plugin_id.to_string()).or_default();
            if list.iter().any(|g| g.matches(permission_type, scope)) {
                return Ok(false);
            }
            list.push(Permission {
                plugin_id: plugin_id.to_string(),
                permission_type: permission_type.to_string(),
                scope: scope.map(str::to_string),
                granted_at: Utc::now(),
            });
        }

        if let Err(e) = self.persist() {
            // Keep memory and disk consistent.
            let mut grants = self.grants.write();
            if let Some(list) = grants.get_mut(plugin_id) {
                list.retain(|g| !g.matches(permission_type, scope));
                if list.is_empty() {
                    grants.remove(plugin_id);
                }
            }
            return Err(e);
        }

        info!(plugin = plugin_id, permission_type, scope, "permission granted");
        self.audit.log(
            plugin_id,
            "permission.grant",
            &display(permission_type, scope),
            true,
        );
        Ok(true)
    }

    pub fn grant_spec(&self, plugin_id: &str, spec: &PermissionSpec) -> Result<bool> {
        self.grant(plugin_id, &spec.permission_type(), spec.scope.as_deref())
    }

    /// Remove one grant. Returns whether it existed.
    pub fn revoke(&self, plugin_id: &str, permission_type: &str, scope: Option<&str>) -> Result<bool> {
        let removed = {
            let mut grants = self.grants.write();
            match grants.get_mut(plugin_id) {
                Some(list) => {
                    let before = list.len();
                    list.retain(|g| !g.matches(permission_type, scope));
                    let removed = list.len() != before;
                    if list.is_empty() {
                        grants.remove(plugin_id);
                    }
                    removed
                }
                None => false,
            }
        };

        if removed {
            self.persist()?;
            info!(plugin = plugin_id, permission_type, scope, "permission revoked");
            self.audit.log(
                plugin_id,
                "permission.revoke",
                &display(permission_type, scope),
                true,
            );
        }
        Ok(removed)
    }

    /// Remove every grant held by `plugin_id`. Returns how many were removed.
    pub fn revoke_all(&self, plugin_id: &str) -> Result<usize> {
        let removed = self.grants.write().remove(plugin_id).map_or(0, |l| l.len());
        if removed > 0 {
            self.persist()?;
            info!(plugin = plugin_id, count = removed, "all permissions revoked");
            self.audit.log(plugin_id, "permission.revoke_all", "*", true);
        }
        Ok(removed)
    }

    /// Exact grant lookup (no scope matching, not audited).
    pub fn is_granted(&self, plugin_id: &str, permission_type: &str, scope: Option<&str>) -> bool {
        self.grants
            .read()
            .get(plugin_id)
            .is_some_and(|list| list.iter().any(|g| g.matches(permission_type, scope)))
    }

    pub fn grants_for(&self, plugin_id: &str) -> Vec<Permission> {
        self.grants.read().get(plugin_id).cloned().unwrap_or_default()
    }

    pub fn all_grants(&self) -> BTreeMap<String, Vec<Permission>> {
        self.grants
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Whether `plugin_id` may perform `permission_type` on `resource`.
    ///
    /// Deny-by-default: true only when a stored grant's scope matches. Network
    /// resources are reduced to their host first. Filesystem resources that
    /// contain `..`, are absolute, or resolve outside the storage root are
    /// refused whatever the grants say. Every call is audited.
    pub fn check(&self, plugin_id: &str, permission_type: &str, resource: &str) -> bool {
        let kind = permission_type
            .split_once('.')
            .and_then(|(k, _)| k.parse::<PermissionKind>().ok());

        let resource = match kind {
            Some(PermissionKind::Network) => network_host(resource),
            Some(PermissionKind::Filesystem) => {
                let normalized = resource.replace('\\', "/");
                if let Err(reason) = self.validate_storage_path(&normalized) {
                    warn!(plugin = plugin_id, resource = %normalized, reason, "path traversal blocked");
                    self.audit.log_detail(
                        plugin_id,
                        permission_type,
                        &normalized,
                        false,
                        "path_traversal",
                    );
                    return false;
                }
                normalized
            }
            _ => resource.to_string(),
        };

        let domain = kind == Some(PermissionKind::Network);
        let allowed = kind.is_some()
            && self.grants.read().get(plugin_id).is_some_and(|list| {
                list.iter().any(|g| {
                    g.permission_type == permission_type
                        && scope_matches(g.scope.as_deref(), &resource, domain)
                })
            });

        if allowed {
            debug!(plugin = plugin_id, permission_type, %resource, "permission check passed");
        } else {
            debug!(plugin = plugin_id, permission_type, %resource, "permission check denied");
        }
        self.audit.log(plugin_id, permission_type, &resource, allowed);
        allowed
    }

    /// Ask the configured policy for `spec`; on approval the grant is stored.
    /// Already-granted permissions are approved without asking.
    pub async fn request_user_authorization(&self, plugin_id: &str, spec: &PermissionSpec) -> bool {
        let permission_type = spec.permission_type();
        if self.is_granted(plugin_id, &permission_type, spec.scope.as_deref()) {
            return true;
        }

        let request = AuthorizationRequest::new(plugin_id, spec);
        let decision = self.policy.authorize(&request).await;
        let approved = decision.is_approved();
        self.audit.log_detail(
            plugin_id,
            "permission.authorize",
            &request.permission,
            approved,
            self.policy.name(),
        );

        if !approved {
            warn!(plugin = plugin_id, permission = %spec, ?decision, "permission not authorized");
            return false;
        }

        match self.grant_spec(plugin_id, spec) {
            Ok(_) => true,
            Err(e) => {
                warn!(plugin = plugin_id, permission = %spec, error = %e, "failed to persist approved permission");
                false
            }
        }
    }

    fn validate_storage_path(&self, resource: &str) -> std::result::Result<(), &'static str> {
        if is_absolute_like(resource) {
            return Err("absolute path");
        }
        if resource.split('/').any(|seg| seg == "..") {
            return Err("parent directory segment");
        }
        let rest = match resource.strip_prefix(STORAGE_PREFIX) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => rest.trim_start_matches('/'),
            _ => return Err("outside the application root"),
        };
        if let Some(root) = &self.storage_root
            && !resolves_within(root, &root.join(rest))
        {
            return Err("resolves outside the application root");
        }
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.store_path else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock();

        let snapshot = {
            let grants = self.grants.read();
            let sorted: BTreeMap<&String, &Vec<Permission>> = grants.iter().collect();
            serde_json::to_vec_pretty(&sorted)?
        };

        let dir = path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&snapshot)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| VcpError::Io(e.error))?;
        debug!(path = ?path, "permission store persisted");
        Ok(())
    }
}

fn display(permission_type: &str, scope: Option<&str>) -> String {
    match scope {
        Some(scope) => format!("{permission_type}:{scope}"),
        None => permission_type.to_string(),
    }
}

fn validate_permission_type(permission_type: &str) -> Result<()> {
    permission_type
        .parse::<PermissionSpec>()
        .map_err(VcpError::ManifestValidation)
        .and_then(|spec| {
            if spec.scope.is_some() {
                Err(VcpError::ManifestValidation(format!(
                    "permission type '{permission_type}' must not carry a scope"
                )))
            } else {
                Ok(())
            }
        })
}

fn load_store(path: &Path) -> Result<HashMap<String, Vec<Permission>>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let raw = std::fs::read(path)?;
    let mut grants: HashMap<String, Vec<Permission>> = serde_json::from_slice(&raw)?;
    for (plugin_id, list) in grants.iter_mut() {
        for grant in list.iter_mut() {
            grant.plugin_id = plugin_id.clone();
        }
    }
    Ok(grants)
}

fn canonical_root(root: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(root)?;
    Ok(root.canonicalize()?)
}

/// Whether `path` (which may not exist yet) stays inside `root` once its
/// deepest existing ancestor is canonicalized. Catches symlink escapes.
pub(crate) fn resolves_within(root: &Path, path: &Path) -> bool {
    let mut existing = path;
    loop {
        if existing.exists() {
            break;
        }
        match existing.parent() {
            Some(parent) => existing = parent,
            None => return false,
        }
    }
    match existing.canonicalize() {
        Ok(canonical) => canonical.starts_with(root),
        Err(_) => false,
    }
}

fn is_absolute_like(path: &str) -> bool {
    let bytes = path.as_bytes();
    path.starts_with('/')
        || (bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':')
}

/// Reduce a network resource to its lowercase host: scheme, credentials,
/// port, and path are stripped.
pub fn network_host(resource: &str) -> String {
    if resource.contains("://")
        && let Ok(url) = url::Url::parse(resource)
        && let Some(host) = url.host_str()
    {
        return host.trim_end_matches('.').to_ascii_lowercase();
    }

    let authority = resource.split(['/', '?', '#']).next().unwrap_or("");
    let authority = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
    let host = if authority.starts_with('[') {
        authority
            .find(']')
            .map_or(authority, |end| &authority[..=end])
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => authority,
        }
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Scope matching rules:
/// - no scope or `*` matches everything;
/// - `*.example.com` matches strict subdomains (domains only);
/// - `prefix/*` matches `prefix` and anything beneath it;
/// - a trailing `*` is a plain prefix match;
/// - anything else is an exact match (case-insensitive for domains).
pub fn scope_matches(scope: Option<&str>, resource: &str, domain: bool) -> bool {
    let Some(scope) = scope else {
        return true;
    };
    if scope == "*" {
        return true;
    }

    if domain {
        if let Some(suffix) = scope.strip_prefix('*') {
            let suffix = suffix.to_ascii_lowercase();
            return suffix.starts_with('.')
                && resource.len() > suffix.len()
                && resource.ends_with(&suffix);
        }
        return network_host(scope) == resource;
    }

    if let Some(prefix) = scope.strip_suffix("/*") {
        return resource == prefix
            || resource
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'));
    }
    if let Some(prefix) = scope.strip_suffix('*') {
        return resource.starts_with(prefix);
    }
    scope == resource
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{AlwaysApprove, AlwaysDeny};

    fn manager(policy: Arc<dyn AuthorizationPolicy>) -> (tempfile::TempDir, PermissionManager) {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditLogger::open(&dir.path().join("audit")).unwrap());
        let pm = PermissionManager::open(
            &dir.path().join("permissions.json"),
            &dir.path().join("AppData"),
            audit,
            policy,
        )
        .unwrap();
        (dir, pm)
    }

    #[test]
    fn test_deny_by_default() {
        let (_dir, pm) = manager(Arc::new(AlwaysDeny));
        assert!(!pm.check("notes", "network.request", "api.example.com"));
        assert!(!pm.check("notes", "filesystem.read", "AppData/notes/a.txt"));
        assert!(!pm.check("notes", "system.notify", ""));
    }

    #[test]
    fn test_wildcard_domain_scope() {
        let (_dir, pm) = manager(Arc::new(AlwaysDeny));
        pm.grant("notes", "network.request", Some("*.example.com")).unwrap();
        assert!(pm.check("notes", "network.request", "api.example.com"));
        assert!(pm.check("notes", "network.request", "cdn.example.com"));
        assert!(pm.check("notes", "network.request", "https://API.example.com:8443/v1?q=1"));
        assert!(!pm.check("notes", "network.request", "example.com"));
        assert!(!pm.check("notes", "network.request", "evil.com"));
        assert!(!pm.check("notes", "network.request", "example.com.evil.com"));
        assert!(!pm.check("other", "network.request", "api.example.com"));
    }

    #[test]
    fn test_exact_domain_ignores_port_and_path() {
        let (_dir, pm) = manager(Arc::new(AlwaysDeny));
        pm.grant("notes", "network.request", Some("api.example.com")).unwrap();
        assert!(pm.check("notes", "network.request", "api.example.com:443/path"));
        assert!(!pm.check("notes", "network.request", "www.example.com"));
    }

    #[test]
    fn test_path_prefix_scope() {
        let (_dir, pm) = manager(Arc::new(AlwaysDeny));
        pm.grant("notes", "filesystem.read", Some("AppData/notes/*")).unwrap();
        assert!(pm.check("notes", "filesystem.read", "AppData/notes/a.txt"));
        assert!(pm.check("notes", "filesystem.read", "AppData/notes/deep/b.txt"));
        assert!(pm.check("notes", "filesystem.read", "AppData/notes"));
        assert!(!pm.check("notes", "filesystem.read", "AppData/notes-evil/a.txt"));
        assert!(!pm.check("notes", "filesystem.write", "AppData/notes/a.txt"));
    }

    #[test]
    fn test_traversal_denied_regardless_of_scope() {
        let (dir, pm) = manager(Arc::new(AlwaysDeny));
        pm.grant("notes", "filesystem.read", Some("*")).unwrap();
        assert!(!pm.check("notes", "filesystem.read", "AppData/notes/../../etc/passwd"));
        assert!(!pm.check("notes", "filesystem.read", "/etc/passwd"));
        assert!(!pm.check("notes", "filesystem.read", "C:\\Windows\\system.ini"));
        assert!(!pm.check("notes", "filesystem.read", "Documents/secret"));
        assert!(pm.check("notes", "filesystem.read", "AppData/notes/ok.txt"));

        let audit = AuditLogger::open(&dir.path().join("audit")).unwrap();
        let entries = audit.recent(20, Some("notes")).unwrap();
        assert!(
            entries
                .iter()
                .any(|e| e.detail.as_deref() == Some("path_traversal") && !e.allowed)
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_denied() {
        let (dir, pm) = manager(Arc::new(AlwaysDeny));
        pm.grant("notes", "filesystem.read", Some("AppData/notes/*")).unwrap();
        let outside = dir.path().join("outside");
        std::fs::create_dir_all(&outside).unwrap();
        std::fs::create_dir_all(dir.path().join("AppData/notes")).unwrap();
        std::os::unix::fs::symlink(&outside, dir.path().join("AppData/notes/link")).unwrap();
        assert!(!pm.check("notes", "filesystem.read", "AppData/notes/link/file.txt"));
    }

    #[test]
    fn test_idempotent_grant() {
        let (_dir, pm) = manager(Arc::new(AlwaysDeny));
        assert!(pm.grant("notes", "system.notify", None).unwrap());
        assert!(!pm.grant("notes", "system.notify", None).unwrap());
        assert_eq!(pm.grants_for("notes").len(), 1);
    }

    #[test]
    fn test_persisted_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("permissions.json");
        let root = dir.path().join("AppData");
        {
            let pm = PermissionManager::open(
                &store,
                &root,
                Arc::new(AuditLogger::disabled()),
                Arc::new(AlwaysDeny),
            )
            .unwrap();
            pm.grant("notes", "network.request", Some("*.example.com")).unwrap();
            pm.grant("notes", "system.notify", None).unwrap();
        }

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&store).unwrap()).unwrap();
        assert_eq!(raw["notes"][0]["type"], "network.request");
        assert_eq!(raw["notes"][0]["scope"], "*.example.com");
        assert!(raw["notes"][0]["granted_at"].is_string());

        let pm = PermissionManager::open(
            &store,
            &root,
            Arc::new(AuditLogger::disabled()),
            Arc::new(AlwaysDeny),
        )
        .unwrap();
        assert_eq!(pm.grants_for("notes").len(), 2);
        assert_eq!(pm.grants_for("notes")[0].plugin_id, "notes");
        assert!(pm.check("notes", "network.request", "api.example.com"));
    }

    #[test]
    fn test_revoke_and_revoke_all() {
        let (_dir, pm) = manager(Arc::new(AlwaysDeny));
        pm.grant("notes", "system.notify", None).unwrap();
        pm.grant("notes", "storage.read", None).unwrap();
        assert!(pm.revoke("notes", "system.notify", None).unwrap());
        assert!(!pm.revoke("notes", "system.notify", None).unwrap());
        assert!(!pm.check("notes", "system.notify", "toast"));
        assert_eq!(pm.revoke_all("notes").unwrap(), 1);
        assert!(pm.grants_for("notes").is_empty());
    }

    #[test]
    fn test_rejects_malformed_permission_type() {
        let (_dir, pm) = manager(Arc::new(AlwaysDeny));
        assert!(pm.grant("notes", "shell.exec", None).is_err());
        assert!(pm.grant("notes", "network.request:*.x.com", None).is_err());
    }

    #[test]
    fn test_every_check_is_audited() {
        let (dir, pm) = manager(Arc::new(AlwaysDeny));
        pm.check("notes", "system.notify", "toast");
        pm.check("notes", "system.notify", "toast");
        let audit = AuditLogger::open(&dir.path().join("audit")).unwrap();
        let checks: Vec<_> = audit
            .recent(10, Some("notes"))
            .unwrap()
            .into_iter()
            .filter(|e| e.action == "system.notify")
            .collect();
        assert_eq!(checks.len(), 2);
        assert!(checks.iter().all(|e| !e.allowed));
    }

    #[tokio::test]
    async fn test_authorization_uses_policy() {
        let (_dir, denying) = manager(Arc::new(AlwaysDeny));
        let spec: PermissionSpec = "system.notify".parse().unwrap();
        assert!(!denying.request_user_authorization("notes", &spec).await);
        assert!(denying.grants_for("notes").is_empty());

        let (_dir, approving) = manager(Arc::new(AlwaysApprove));
        assert!(approving.request_user_authorization("notes", &spec).await);
        assert!(approving.is_granted("notes", "system.notify", None));
    }

    #[tokio::test]
    async fn test_existing_grant_skips_policy() {
        let (_dir, pm) = manager(Arc::new(AlwaysDeny));
        pm.grant("notes", "system.notify", None).unwrap();
        let spec: PermissionSpec = "system.notify".parse().unwrap();
        assert!(pm.request_user_authorization("notes", &spec).await);
    }

    #[test]
    fn test_host_extraction() {
        assert_eq!(network_host("https://Api.Example.com:8080/x"), "api.example.com");
        assert_eq!(network_host("api.example.com:8080/x"), "api.example.com");
        assert_eq!(network_host("user@api.example.com"), "api.example.com");
        assert_eq!(network_host("[::1]:80"), "[::1]");
        assert_eq!(network_host("example.com."), "example.com");
    }

    #[test]
    fn test_scope_rules() {
        assert!(scope_matches(None, "anything", false));
        assert!(scope_matches(Some("*"), "anything", true));
        assert!(scope_matches(Some("*.example.com"), "a.b.example.com", true));
        assert!(!scope_matches(Some("*.example.com"), "example.com", true));
        assert!(scope_matches(Some("AppData/x*"), "AppData/x2", false));
        assert!(scope_matches(Some("exact"), "exact", false));
        assert!(!scope_matches(Some("exact"), "exactly", false));
    }
}
