#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use std::io::{Cursor, Write};
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use vcp_config::VcpConfig;
    use vcp_core::{EventBus, NetworkError, PluginState, VcpError};
    use vcp_plugin::manager::{EVENT_ACTIVATED, EVENT_DEACTIVATED, EVENT_INSTALLED, EVENT_UNINSTALLED};
    use vcp_plugin::*;

    // ── Fixtures ───────────────────────────────────────────────

    struct Counting {
        calls: AtomicUsize,
    }

    impl Counting {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HttpTransport for Counting {
        async fn send(
            &self,
            request: &HttpRequest,
            _timeout: Duration,
        ) -> Result<HttpResponse, NetworkError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let who = request.header("authorization").unwrap_or("anonymous");
            Ok(HttpResponse::new(200, format!("{who}:{n}").into_bytes()))
        }
    }

    /// Never answers.
    struct Hanging;

    #[async_trait]
    impl HttpTransport for Hanging {
        async fn send(
            &self,
            _request: &HttpRequest,
            _timeout: Duration,
        ) -> Result<HttpResponse, NetworkError> {
            std::future::pending().await
        }
    }

    /// Registers a command and a listener, then fails.
    struct Flaky;

    #[async_trait]
    impl Plugin for Flaky {
        async fn activate(&self, ctx: &PluginContext) -> vcp_core::Result<()> {
            ctx.register_command("flaky.run", Arc::new(|_: Value| Ok(Value::Null)))?;
            ctx.on("system:plugin-installed", |_| {});
            Err(VcpError::Command("boom".into()))
        }
    }

    fn config(dir: &Path) -> VcpConfig {
        let mut config = VcpConfig::default();
        config.paths.data_dir = dir.to_path_buf();
        config
    }

    fn manager(dir: &Path, policy: Arc<dyn AuthorizationPolicy>) -> PluginManager {
        PluginManager::builder(config(dir))
            .policy(policy)
            .transport(Counting::new())
            .build()
            .unwrap()
    }

    fn manifest(name: &str, permissions: &[&str], deps: &[(&str, &str)], commands: &[&str]) -> String {
        let deps: serde_json::Map<String, Value> =
            deps.iter().map(|(d, r)| (d.to_string(), json!(r))).collect();
        let commands: Vec<Value> = commands
            .iter()
            .map(|c| json!({ "identifier": format!("{name}.{c}"), "title": c }))
            .collect();
        json!({
            "manifestVersion": "1.0.0",
            "name": name,
            "displayName": name,
            "version": "1.0.0",
            "main": "index.js",
            "permissions": permissions,
            "dependencies": deps,
            "contributes": { "commands": commands },
        })
        .to_string()
    }

    fn zip(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in files {
            writer
                .start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn package(manifest: &str) -> Vec<u8> {
        zip(&[("manifest.json", manifest.as_bytes()), ("index.js", b"export {}")])
    }

    fn record(events: &EventBus, names: &[&str]) -> Arc<Mutex<Vec<(String, Value)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        for name in names {
            let seen = seen.clone();
            let label = name.to_string();
            events.on(name, move |payload| seen.lock().push((label.clone(), payload.clone())));
        }
        seen
    }

    // ── Permissions ────────────────────────────────────────────

    #[tokio::test]
    async fn test_deny_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), Arc::new(AlwaysDeny));
        let pm = mgr.permissions();
        assert!(!pm.check("any", "network.request", "api.example.com"));
        assert!(!pm.check("any", "filesystem.read", "AppData/any/x"));
        assert!(!pm.check("any", "storage.read", "key"));
        assert!(!pm.check("any", "ui.registerCommand", "any.open"));

        let err = mgr
            .network()
            .request("any", HttpRequest::get("https://api.example.com/"))
            .await
            .unwrap_err();
        assert!(matches!(err, VcpError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn test_wildcard_domain_through_proxy() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), Arc::new(AlwaysDeny));
        mgr.permissions()
            .grant("w", "network.request", Some("*.example.com"))
            .unwrap();

        for ok in ["https://api.example.com/a", "https://cdn.example.com:8443/b"] {
            mgr.network().request("w", HttpRequest::get(ok)).await.unwrap();
        }
        for denied in ["https://example.com/", "https://evil.com/", "https://example.com.evil.com/"] {
            let err = mgr.network().request("w", HttpRequest::get(denied)).await.unwrap_err();
            assert!(matches!(err, VcpError::PermissionDenied { .. }), "{denied}");
        }
    }

    #[tokio::test]
    async fn test_idempotent_grant_is_stored_once() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), Arc::new(AlwaysDeny));
        let pm = mgr.permissions();
        pm.grant("p", "storage.read", Some("settings")).unwrap();
        pm.grant("p", "storage.read", Some("settings")).unwrap();
        assert_eq!(pm.grants_for("p").len(), 1);

        let raw: Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("permissions.json")).unwrap()).unwrap();
        assert_eq!(raw["p"].as_array().unwrap().len(), 1);
    }

    // ── File system ────────────────────────────────────────────

    #[tokio::test]
    async fn test_path_traversal_blocked_whatever_the_scope() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), Arc::new(AlwaysDeny));
        mgr.permissions().grant("p", "filesystem.read", Some("*")).unwrap();
        mgr.permissions().grant("p", "filesystem.read", None).unwrap();
        std::fs::write(dir.path().join("secret.txt"), "top secret").unwrap();

        let ctx = mgr.context_for("p");
        for path in ["../../etc/passwd", "../secret.txt", "/etc/passwd", "sub/../../../secret.txt"] {
            let err = ctx.read(path).unwrap_err();
            assert!(matches!(err, VcpError::PathTraversal { .. }), "{path}: {err}");
        }

        let audit = mgr.audit().recent(50, Some("p")).unwrap();
        assert!(audit.iter().any(|e| e.detail.as_deref() == Some("path_traversal")));
    }

    // ── Network ────────────────────────────────────────────────

    #[tokio::test]
    async fn test_cache_respects_authorization_and_method() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Counting::new();
        let mgr = PluginManager::builder(config(dir.path()))
            .transport(transport.clone())
            .build()
            .unwrap();
        mgr.permissions()
            .grant("c", "network.request", Some("api.example.com"))
            .unwrap();
        let url = "https://api.example.com/profile";
        let net = mgr.network();

        let alice = net
            .request("c", HttpRequest::get(url).with_header("Authorization", "Bearer alice"))
            .await
            .unwrap();
        let bob = net
            .request("c", HttpRequest::get(url).with_header("Authorization", "Bearer bob"))
            .await
            .unwrap();
        assert_eq!(alice.text(), "Bearer alice:1");
        assert_eq!(bob.text(), "Bearer bob:2");
        assert!(!bob.from_cache);

        let alice_again = net
            .request("c", HttpRequest::get(url).with_header("Authorization", "Bearer alice"))
            .await
            .unwrap();
        assert!(alice_again.from_cache);
        assert_eq!(alice_again.text(), "Bearer alice:1");
        assert_eq!(transport.calls(), 2);

        let first = net.request("c", HttpRequest::post(url, b"{}".to_vec())).await.unwrap();
        let second = net.request("c", HttpRequest::post(url, b"{}".to_vec())).await.unwrap();
        assert!(!first.from_cache && !second.from_cache);
        assert_ne!(first.text(), second.text());
        assert_eq!(transport.calls(), 4);

        let audit = mgr.audit().recent(100, Some("c")).unwrap();
        assert!(audit.iter().any(|e| e.detail.as_deref() == Some("cache_hit")));
    }

    #[tokio::test]
    async fn test_rate_limit_burst_then_refill() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.network.rate_limit_burst = 3;
        cfg.network.rate_limit_refill_per_sec = 10.0;
        let mgr = PluginManager::builder(cfg)
            .transport(Counting::new())
            .build()
            .unwrap();
        mgr.permissions().grant("r", "network.request", None).unwrap();

        for i in 0..3 {
            let url = format!("https://api.example.com/{i}");
            mgr.network().request("r", HttpRequest::get(&url)).await.unwrap();
        }
        let err = mgr
            .network()
            .request("r", HttpRequest::get("https://api.example.com/3"))
            .await
            .unwrap_err();
        match err {
            VcpError::Network(NetworkError::RateLimited { retry_after }) => {
                assert!(retry_after <= Duration::from_millis(100));
            }
            other => panic!("expected RateLimited, got {other}"),
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        mgr.network()
            .request("r", HttpRequest::get("https://api.example.com/4"))
            .await
            .unwrap();

        // Another plugin has its own bucket.
        mgr.permissions().grant("s", "network.request", None).unwrap();
        mgr.network()
            .request("s", HttpRequest::get("https://api.example.com/5"))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_clamped_to_maximum() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = PluginManager::builder(config(dir.path()))
            .transport(Arc::new(Hanging))
            .build()
            .unwrap();
        mgr.permissions()
            .grant("t", "network.request", Some("unreachable.example.com"))
            .unwrap();

        let started = tokio::time::Instant::now();
        let err = mgr
            .network()
            .request(
                "t",
                HttpRequest::get("https://unreachable.example.com/")
                    .with_timeout(Duration::from_secs(500)),
            )
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(
            err,
            VcpError::Network(NetworkError::Timeout { after }) if after == Duration::from_secs(300)
        ));
        assert!(elapsed >= Duration::from_secs(300));
        assert!(elapsed < Duration::from_secs(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unset_timeout_uses_default() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = PluginManager::builder(config(dir.path()))
            .transport(Arc::new(Hanging))
            .build()
            .unwrap();
        mgr.permissions().grant("t", "network.request", None).unwrap();
        let err = mgr
            .network()
            .request("t", HttpRequest::get("https://slow.example.com/"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VcpError::Network(NetworkError::Timeout { after }) if after == Duration::from_secs(30)
        ));
    }

    // ── Install ────────────────────────────────────────────────

    #[tokio::test]
    async fn test_install_registers_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), Arc::new(AlwaysDeny));
        let seen = record(mgr.events(), &[EVENT_INSTALLED]);

        let id = mgr.install(&package(&manifest("notes", &[], &[], &[]))).await.unwrap();
        assert_eq!(id, "notes");
        assert_eq!(mgr.state("notes"), Some(PluginState::Installed));
        assert!(mgr.plugin_dir().join("notes/index.js").is_file());
        assert_eq!(
            seen.lock().as_slice(),
            &[(EVENT_INSTALLED.to_string(), json!({ "pluginId": "notes", "version": "1.0.0" }))]
        );

        let err = mgr.install(&package(&manifest("notes", &[], &[], &[]))).await.unwrap_err();
        assert!(matches!(err, VcpError::AlreadyInstalled { .. }));
    }

    #[tokio::test]
    async fn test_failed_install_leaves_no_state() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), Arc::new(AlwaysDeny));

        let no_main = zip(&[("manifest.json", manifest("notes", &[], &[], &[]).as_bytes())]);
        assert!(mgr.install(&no_main).await.is_err());

        let bad_permission = package(&manifest("notes", &["shell.exec"], &[], &[]));
        assert!(matches!(
            mgr.install(&bad_permission).await.unwrap_err(),
            VcpError::ManifestValidation(_)
        ));

        assert!(mgr.list().is_empty());
        assert_eq!(std::fs::read_dir(mgr.plugin_dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_incompatible_engine_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), Arc::new(AlwaysDeny));
        let mut m: Value = serde_json::from_str(&manifest("future", &[], &[], &[])).unwrap();
        m["engines"] = json!({ "vcp": ">=99.0.0" });
        let err = mgr.install(&package(&m.to_string())).await.unwrap_err();
        assert!(matches!(err, VcpError::Package(_)));
        assert!(mgr.list().is_empty());
    }

    #[tokio::test]
    async fn test_install_from_directory_and_discover_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("manifest.json"), manifest("notes", &["system.notify"], &[], &[])).unwrap();
        std::fs::write(src.path().join("index.js"), "export {}").unwrap();

        {
            let mgr = manager(dir.path(), Arc::new(AlwaysApprove));
            mgr.install_from_path(src.path()).await.unwrap();
            mgr.activate("notes").await.unwrap();
            assert_eq!(mgr.state("notes"), Some(PluginState::Running));
            assert_eq!(mgr.shutdown().await, 1);
            assert!(mgr.list().is_empty());
        }

        let mgr = manager(dir.path(), Arc::new(AlwaysDeny));
        assert_eq!(mgr.discover().unwrap(), vec!["notes"]);
        assert_eq!(mgr.state("notes"), Some(PluginState::Installed));
        // Grants survive restarts, so a deny policy still lets it start.
        assert!(mgr.permissions().is_granted("notes", "system.notify", None));
        mgr.activate("notes").await.unwrap();
    }

    // ── Lifecycle ──────────────────────────────────────────────

    #[tokio::test]
    async fn test_full_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), Arc::new(AlwaysApprove));
        let seen = record(
            mgr.events(),
            &[EVENT_ACTIVATED, EVENT_DEACTIVATED, EVENT_UNINSTALLED, "notes:open"],
        );

        let m = manifest(
            "notes",
            &["ui.registerCommand", "filesystem.write:AppData/notes/*"],
            &[],
            &["open"],
        );
        mgr.install(&package(&m)).await.unwrap();
        mgr.activate("notes").await.unwrap();
        assert_eq!(mgr.state("notes"), Some(PluginState::Running));

        let out = mgr.commands().execute("notes.open", json!({ "file": "a.md" })).unwrap();
        assert_eq!(out["delivered"], 1);

        mgr.permissions()
            .grant("notes", "filesystem.read", Some("AppData/notes/*"))
            .unwrap();
        let ctx = mgr.context_for("notes");
        ctx.write("a.md", b"# hi").unwrap();
        assert_eq!(ctx.read_to_string("a.md").unwrap(), "# hi");

        let err = mgr.uninstall("notes").await.unwrap_err();
        assert!(matches!(err, VcpError::InvalidStateTransition { from: PluginState::Running, .. }));

        mgr.deactivate("notes").await.unwrap();
        assert_eq!(mgr.state("notes"), Some(PluginState::Installed));
        assert!(mgr.commands().is_empty());

        mgr.activate("notes").await.unwrap();
        mgr.deactivate("notes").await.unwrap();

        mgr.uninstall("notes").await.unwrap();
        assert!(mgr.get("notes").is_none());
        assert!(mgr.permissions().grants_for("notes").is_empty());
        assert!(!dir.path().join("AppData/notes").exists());
        assert!(!mgr.plugin_dir().join("notes").exists());

        let names: Vec<String> = seen.lock().iter().map(|(n, _)| n.clone()).collect();
        assert_eq!(
            names,
            vec![
                EVENT_ACTIVATED,
                "notes:open",
                EVENT_DEACTIVATED,
                EVENT_ACTIVATED,
                EVENT_DEACTIVATED,
                EVENT_UNINSTALLED
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_transitions_have_no_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), Arc::new(AlwaysApprove));
        mgr.install(&package(&manifest("notes", &[], &[], &[]))).await.unwrap();

        let err = mgr.deactivate("notes").await.unwrap_err();
        assert!(matches!(
            err,
            VcpError::InvalidStateTransition { from: PluginState::Installed, to: PluginState::Deactivated, .. }
        ));
        assert_eq!(mgr.state("notes"), Some(PluginState::Installed));

        mgr.activate("notes").await.unwrap();
        let err = mgr.activate("notes").await.unwrap_err();
        assert!(matches!(err, VcpError::InvalidStateTransition { from: PluginState::Running, .. }));
        assert_eq!(mgr.state("notes"), Some(PluginState::Running));

        // A rollback wrapper must not tear down a plugin that was already running.
        assert!(mgr.activate_with_rollback("notes").await.is_err());
        assert_eq!(mgr.state("notes"), Some(PluginState::Running));

        assert!(matches!(
            mgr.activate("ghost").await.unwrap_err(),
            VcpError::PluginNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_denied_permission_reverts_to_installed() {
        let dir = tempfile::tempdir().unwrap();
        let policy = Arc::new(AllowListPolicy::new(vec!["ui.*".into()]));
        let mgr = manager(dir.path(), policy);
        let m = manifest(
            "fetcher",
            &["ui.registerCommand", "network.request:*.example.com"],
            &[],
            &["go"],
        );
        mgr.install(&package(&m)).await.unwrap();

        let err = mgr.activate("fetcher").await.unwrap_err();
        match err {
            VcpError::PermissionDenied { permission_type, resource, .. } => {
                assert_eq!(permission_type, "network.request");
                assert_eq!(resource, "*.example.com");
            }
            other => panic!("expected PermissionDenied, got {other}"),
        }
        assert_eq!(mgr.state("fetcher"), Some(PluginState::Installed));
        assert!(mgr.commands().is_empty());
        // The ui grant approved during the failed attempt is withdrawn.
        assert!(mgr.permissions().grants_for("fetcher").is_empty());
    }

    #[tokio::test]
    async fn test_failing_hook_and_rollback() {
        let dir = tempfile::tempdir().unwrap();
        let events = EventBus::new();
        let loader = StaticLoader::new(Box::new(DeclarativeLoader::new(events.clone())));
        loader.register("flaky", Arc::new(Flaky));
        let mgr = PluginManager::builder(config(dir.path()))
            .policy(Arc::new(AlwaysApprove))
            .transport(Counting::new())
            .events(events.clone())
            .loader(Arc::new(loader))
            .build()
            .unwrap();
        mgr.install(&package(&manifest("flaky", &["ui.registerCommand"], &[], &[])))
            .await
            .unwrap();
        let before = events.subscriber_count("system:plugin-installed");

        // Plain activate reports the failure and leaves the half-started plugin.
        let err = mgr.activate("flaky").await.unwrap_err();
        assert!(matches!(err, VcpError::Activation { .. }));
        assert_eq!(mgr.state("flaky"), Some(PluginState::Activated));
        assert!(mgr.commands().contains("flaky.run"));

        // The rollback wrapper cleans it up.
        assert!(mgr.activate_with_rollback("flaky").await.is_err());
        assert_eq!(mgr.state("flaky"), Some(PluginState::Installed));
        assert!(mgr.commands().is_empty());
        assert_eq!(events.subscriber_count("system:plugin-installed"), before);
        assert!(!mgr.permissions().is_granted("flaky", "ui.registerCommand", None));

        // And from a clean state the wrapper alone leaves nothing behind.
        assert!(mgr.activate_with_rollback("flaky").await.is_err());
        assert_eq!(mgr.state("flaky"), Some(PluginState::Installed));
        assert!(mgr.commands().is_empty());
        assert_eq!(events.subscriber_count("system:plugin-installed"), before);
    }

    // ── Dependencies ───────────────────────────────────────────

    #[tokio::test]
    async fn test_cycle_detected_across_installed_plugins() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), Arc::new(AlwaysApprove));
        mgr.install(&package(&manifest("a", &[], &[("b", "^1")], &[]))).await.unwrap();
        mgr.install(&package(&manifest("b", &[], &[("a", "^1")], &[]))).await.unwrap();

        match mgr.resolve_dependencies(&["a".to_string()]).unwrap_err() {
            VcpError::DependencyResolution { plugins, .. } => {
                assert!(plugins.contains(&"a".to_string()));
                assert!(plugins.contains(&"b".to_string()));
            }
            other => panic!("expected DependencyResolution, got {other}"),
        }
        assert!(mgr.activate_with_dependencies("a").await.is_err());
        assert_eq!(mgr.state("a"), Some(PluginState::Installed));
        assert_eq!(mgr.state("b"), Some(PluginState::Installed));
    }

    #[tokio::test]
    async fn test_dependencies_activate_in_order_and_stop_in_reverse() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), Arc::new(AlwaysApprove));
        mgr.install(&package(&manifest("app", &[], &[("lib", "^1.0")], &[]))).await.unwrap();
        mgr.install(&package(&manifest("lib", &[], &[], &[]))).await.unwrap();

        let err = mgr.activate("app").await.unwrap_err();
        assert!(matches!(err, VcpError::DependencyResolution { .. }));
        assert_eq!(mgr.state("app"), Some(PluginState::Installed));

        let order = mgr.activate_with_dependencies("app").await.unwrap();
        assert_eq!(order, vec!["lib", "app"]);
        assert_eq!(mgr.state("lib"), Some(PluginState::Running));
        assert_eq!(mgr.state("app"), Some(PluginState::Running));

        assert!(matches!(
            mgr.deactivate("lib").await.unwrap_err(),
            VcpError::DependencyResolution { .. }
        ));

        assert_eq!(mgr.shutdown().await, 2);
        assert!(mgr.list().is_empty());
    }

    #[tokio::test]
    async fn test_failed_dependency_chain_undoes_started_plugins() {
        let dir = tempfile::tempdir().unwrap();
        let policy = Arc::new(AllowListPolicy::new(vec!["system.*".into()]));
        let mgr = manager(dir.path(), policy);
        mgr.install(&package(&manifest("base", &["system.notify"], &[], &[]))).await.unwrap();
        mgr.install(&package(&manifest("top", &["network.request"], &[("base", "*")], &[])))
            .await
            .unwrap();

        assert!(mgr.activate_with_dependencies("top").await.is_err());
        assert_eq!(mgr.state("base"), Some(PluginState::Installed));
        assert_eq!(mgr.state("top"), Some(PluginState::Installed));
    }
}
