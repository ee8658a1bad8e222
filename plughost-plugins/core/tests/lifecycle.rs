// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

mod common;

use common::{manifest, package, Harness, HookBehaviour, Probe, TENANT};
use async_trait::async_trait;
use plughost_plugins::{
    ApiRequest, AuditLogger, AuditQuery, ErrorKind, InMemoryPluginStore, Plugin, PluginConfig,
    PluginError, PluginEventType, PluginResult, PluginStatus, PluginStore, UiResource,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[tokio::test]
async fn test_full_lifecycle() {
    let h = Harness::new().await;
    let probe = h.register("crm-sync", HookBehaviour::Succeed);

    let plugin = h
        .manager
        .install(package(&manifest("crm-sync", "1.0.0"), &[]), TENANT)
        .await
        .unwrap();
    assert_eq!(plugin.status, PluginStatus::Installed);
    assert!(plugin.install_path.join("dist/index.js").is_file());
    assert!(plugin.install_path.starts_with(h.dir.path().join("plugins").join(TENANT)));
    assert_eq!(Probe::count(&probe.installs), 1);
    assert!(h.manager.get_runtime(plugin.id).is_none());

    let active = h.manager.activate(plugin.id, TENANT).await.unwrap();
    assert_eq!(active.status, PluginStatus::Active);
    assert_eq!(Probe::count(&probe.activations), 1);
    assert_eq!(Probe::count(&probe.initialized), 1);
    assert_eq!(h.manager.get_all_runtimes().len(), 1);

    let inactive = h.manager.deactivate(plugin.id, TENANT).await.unwrap();
    assert_eq!(inactive.status, PluginStatus::Inactive);
    assert_eq!(Probe::count(&probe.deactivations), 1);
    assert_eq!(Probe::count(&probe.cleaned_up), 1);
    assert!(h.manager.get_runtime(plugin.id).is_none());

    h.manager.uninstall(plugin.id, TENANT).await.unwrap();
    assert_eq!(Probe::count(&probe.uninstalls), 1);
    assert!(!plugin.install_path.exists());
    assert!(h.manager.list_plugins(TENANT).await.unwrap().is_empty());
    assert!(matches!(
        h.manager.get_plugin(plugin.id, TENANT).await,
        Err(PluginError::NotFound(_))
    ));

    assert_eq!(
        h.event_types(),
        vec![
            PluginEventType::Installed,
            PluginEventType::Activated,
            PluginEventType::Deactivated,
            PluginEventType::Uninstalled,
        ]
    );
}

#[tokio::test]
async fn test_activate_twice_runs_hook_once() {
    let h = Harness::new().await;
    let probe = h.register("crm-sync", HookBehaviour::Succeed);
    let plugin = h
        .manager
        .install(package(&manifest("crm-sync", "1.0.0"), &[]), TENANT)
        .await
        .unwrap();

    h.manager.activate(plugin.id, TENANT).await.unwrap();
    let again = h.manager.activate(plugin.id, TENANT).await.unwrap();
    assert_eq!(again.status, PluginStatus::Active);
    assert_eq!(Probe::count(&probe.activations), 1);
    assert_eq!(Probe::count(&probe.initialized), 1);

    h.manager.deactivate(plugin.id, TENANT).await.unwrap();
    h.manager.deactivate(plugin.id, TENANT).await.unwrap();
    assert_eq!(Probe::count(&probe.deactivations), 1);
}

#[tokio::test]
async fn test_concurrent_activation_serializes() {
    let h = Harness::new().await;
    let probe = h.register("crm-sync", HookBehaviour::Succeed);
    let plugin = h
        .manager
        .install(package(&manifest("crm-sync", "1.0.0"), &[]), TENANT)
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        h.manager.activate(plugin.id, TENANT),
        h.manager.activate(plugin.id, TENANT)
    );
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(Probe::count(&probe.activations), 1);
    assert_eq!(h.manager.active_count(), 1);
}

#[tokio::test]
async fn test_uninstall_active_plugin_deactivates_first() {
    let h = Harness::new().await;
    let probe = h.register("crm-sync", HookBehaviour::Succeed);
    let plugin = h
        .manager
        .install(package(&manifest("crm-sync", "1.0.0"), &[]), TENANT)
        .await
        .unwrap();
    h.manager.activate(plugin.id, TENANT).await.unwrap();

    h.manager.uninstall(plugin.id, TENANT).await.unwrap();
    assert_eq!(Probe::count(&probe.deactivations), 1);
    assert_eq!(Probe::count(&probe.uninstalls), 1);
    assert_eq!(Probe::count(&probe.cleaned_up), 1);
    assert_eq!(h.manager.active_count(), 0);
    assert!(h.event_types().contains(&PluginEventType::Deactivated));
}

#[tokio::test]
async fn test_duplicate_install_is_a_conflict() {
    let h = Harness::new().await;
    h.register("crm-sync", HookBehaviour::Succeed);

    let first = h
        .manager
        .install(package(&manifest("crm-sync", "1.0.0"), &[]), TENANT)
        .await
        .unwrap();
    let err = h
        .manager
        .install(package(&manifest("crm-sync", "1.1.0"), &[]), TENANT)
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::AlreadyInstalled(_)));
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let plugins = h.manager.list_plugins(TENANT).await.unwrap();
    assert_eq!(plugins.len(), 1);
    assert_eq!(plugins[0].id, first.id);
    assert_eq!(plugins[0].version(), "1.0.0");
    assert!(first.install_path.is_dir());

    // Only the first package was extracted
    let tenant_dir = h.dir.path().join("plugins").join(TENANT);
    assert_eq!(std::fs::read_dir(tenant_dir).unwrap().count(), 1);

    // Other tenants are independent
    let other = h
        .manager
        .install(package(&manifest("crm-sync", "1.1.0"), &[]), "globex")
        .await
        .unwrap();
    assert_ne!(other.id, first.id);
    assert!(h.event_types().contains(&PluginEventType::Failed));
}

#[tokio::test]
async fn test_failing_and_stalling_hooks_never_abort_transitions() {
    let h = Harness::with_config(|c| c.hook_timeout_ms = 50).await;
    let failing = h.register("failing", HookBehaviour::Fail);
    let stalling = h.register("stalling", HookBehaviour::Stall(Duration::from_secs(5)));

    for (name, probe) in [("failing", &failing), ("stalling", &stalling)] {
        let plugin = h
            .manager
            .install(package(&manifest(name, "1.0.0"), &[]), TENANT)
            .await
            .unwrap();
        assert_eq!(plugin.status, PluginStatus::Installed);

        let active = h.manager.activate(plugin.id, TENANT).await.unwrap();
        assert_eq!(active.status, PluginStatus::Active);
        let inactive = h.manager.deactivate(plugin.id, TENANT).await.unwrap();
        assert_eq!(inactive.status, PluginStatus::Inactive);
        h.manager.uninstall(plugin.id, TENANT).await.unwrap();

        assert_eq!(Probe::count(&probe.installs), 1);
        assert_eq!(Probe::count(&probe.activations), 1);
        assert_eq!(Probe::count(&probe.deactivations), 1);
        assert_eq!(Probe::count(&probe.uninstalls), 1);
    }
    assert!(h.manager.list_plugins(TENANT).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_undeclared_hooks_are_skipped() {
    let h = Harness::new().await;
    let probe = h.register("quiet", HookBehaviour::Succeed);
    let mut raw = manifest("quiet", "1.0.0");
    raw.as_object_mut().unwrap().remove("hooks");

    let plugin = h.manager.install(package(&raw, &[]), TENANT).await.unwrap();
    h.manager.activate(plugin.id, TENANT).await.unwrap();
    assert_eq!(Probe::count(&probe.installs), 0);
    assert_eq!(Probe::count(&probe.activations), 0);
    assert_eq!(Probe::count(&probe.initialized), 1);
}

#[tokio::test]
async fn test_activation_failure_leaves_status_unchanged() {
    let h = Harness::new().await;
    // No entry point registered for this name
    let plugin = h
        .manager
        .install(package(&manifest("orphan", "1.0.0"), &[]), TENANT)
        .await
        .unwrap();

    let err = h.manager.activate(plugin.id, TENANT).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RuntimeLoad);
    let stored = h.manager.get_plugin(plugin.id, TENANT).await.unwrap();
    assert_eq!(stored.status, PluginStatus::Installed);
    assert!(h.manager.get_runtime(plugin.id).is_none());
}

#[tokio::test]
async fn test_unknown_plugin_and_wrong_tenant() {
    let h = Harness::new().await;
    h.register("crm-sync", HookBehaviour::Succeed);
    let plugin = h
        .manager
        .install(package(&manifest("crm-sync", "1.0.0"), &[]), TENANT)
        .await
        .unwrap();

    assert!(matches!(
        h.manager.activate(Uuid::new_v4(), TENANT).await,
        Err(PluginError::NotFound(_))
    ));
    assert!(matches!(
        h.manager.activate(plugin.id, "globex").await,
        Err(PluginError::NotFound(_))
    ));
    assert!(matches!(
        h.manager.uninstall(plugin.id, "globex").await,
        Err(PluginError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_api_requests_are_permission_gated() {
    let h = Harness::new().await;
    h.register("crm-sync", HookBehaviour::Succeed);
    let plugin = h
        .manager
        .install(package(&manifest("crm-sync", "1.0.0"), &[]), TENANT)
        .await
        .unwrap();

    let err = h
        .manager
        .handle_api_request(plugin.id, TENANT, ApiRequest::new("GET", "/contacts"))
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::NotLoaded(_)));

    h.manager.activate(plugin.id, TENANT).await.unwrap();

    let response = h
        .manager
        .handle_api_request(plugin.id, TENANT, ApiRequest::new("get", "/contacts"))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, serde_json::json!(["ada", "grace"]));

    // Declared route outside the declared methods
    let denied = h
        .manager
        .handle_api_request(plugin.id, TENANT, ApiRequest::new("POST", "/contacts/export"))
        .await
        .unwrap_err();
    assert!(matches!(denied, PluginError::PermissionDenied { .. }));

    // Permitted but undeclared path
    let missing = h
        .manager
        .handle_api_request(plugin.id, TENANT, ApiRequest::new("GET", "/contacts/unknown"))
        .await
        .unwrap_err();
    assert!(matches!(missing, PluginError::RouteNotFound { .. }));
}

#[tokio::test]
async fn test_database_access_without_permission_is_denied() {
    let h = Harness::new().await;
    h.register("crm-sync", HookBehaviour::Succeed);
    let plugin = h
        .manager
        .install(package(&manifest("crm-sync", "1.0.0"), &[]), TENANT)
        .await
        .unwrap();
    h.manager.activate(plugin.id, TENANT).await.unwrap();

    let err = h
        .manager
        .handle_api_request(plugin.id, TENANT, ApiRequest::new("GET", "/contacts/db"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    let runtime = h.manager.get_runtime(plugin.id).unwrap();
    let err = runtime
        .context
        .database()
        .get_repository("Contact", "contacts")
        .unwrap_err();
    assert!(matches!(err, PluginError::PermissionDenied { .. }));
}

#[tokio::test]
async fn test_database_access_with_permission() {
    let h = Harness::new().await;
    h.register("crm-sync", HookBehaviour::Succeed);
    let mut raw = manifest("crm-sync", "1.0.0");
    raw["permissions"]["database"] = serde_json::json!({
        "tables": ["contacts"],
        "operations": ["read", "write"]
    });
    let plugin = h.manager.install(package(&raw, &[]), TENANT).await.unwrap();
    h.manager.activate(plugin.id, TENANT).await.unwrap();

    let runtime = h.manager.get_runtime(plugin.id).unwrap();
    let contacts = runtime.context.database().get_repository("Contact", "contacts").unwrap();
    contacts.insert(serde_json::json!({ "name": "ada" })).await.unwrap();
    assert!(matches!(
        contacts.delete(serde_json::json!({ "name": "ada" })).await,
        Err(PluginError::PermissionDenied { .. })
    ));

    let response = h
        .manager
        .handle_api_request(plugin.id, TENANT, ApiRequest::new("GET", "/contacts/db"))
        .await
        .unwrap();
    assert_eq!(response.body, serde_json::json!([{ "name": "ada" }]));
}

#[tokio::test]
async fn test_audit_log_records_lifecycle() {
    let h = Harness::new().await;
    h.register("crm-sync", HookBehaviour::Succeed);
    let audit = Arc::new(AuditLogger::open(h.dir.path().join("audit.jsonl")).unwrap());
    let _subscription = audit.attach(h.manager.events());

    let plugin = h
        .manager
        .install(package(&manifest("crm-sync", "1.0.0"), &[]), TENANT)
        .await
        .unwrap();
    h.manager.activate(plugin.id, TENANT).await.unwrap();
    h.manager.deactivate(plugin.id, TENANT).await.unwrap();

    let entries = audit
        .query_logs(&AuditQuery {
            plugin_id: Some(plugin.id),
            ..Default::default()
        })
        .unwrap();
    let actions: Vec<&str> = entries.iter().map(|e| e.action.as_str()).collect();
    assert_eq!(
        actions,
        vec!["plugin.installed", "plugin.activated", "plugin.deactivated"]
    );
    assert!(entries.iter().all(|e| e.success && e.tenant_id == TENANT));

    let activations = audit
        .query_logs(&AuditQuery {
            event_type: Some(PluginEventType::Activated),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(activations.len(), 1);
}

#[tokio::test]
async fn test_concurrent_installs_of_the_same_name() {
    let h = Harness::new().await;
    let probe = h.register("crm-sync", HookBehaviour::Succeed);

    let (a, b) = tokio::join!(
        h.manager
            .install(package(&manifest("crm-sync", "1.0.0"), &[]), TENANT),
        h.manager
            .install(package(&manifest("crm-sync", "1.0.1"), &[]), TENANT)
    );
    let (winner, loser) = match (a, b) {
        (Ok(plugin), Err(e)) | (Err(e), Ok(plugin)) => (plugin, e),
        (a, b) => panic!("expected exactly one install to succeed: {a:?} / {b:?}"),
    };
    assert!(matches!(loser, PluginError::AlreadyInstalled(_)));

    let plugins = h.manager.list_plugins(TENANT).await.unwrap();
    assert_eq!(plugins.len(), 1);
    assert_eq!(plugins[0].id, winner.id);

    let tenant_dir = h.dir.path().join("plugins").join(TENANT);
    let dirs: Vec<_> = std::fs::read_dir(tenant_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(dirs, vec![winner.install_path.clone()]);
    assert_eq!(Probe::count(&probe.installs), 1);
}

/// In-memory store whose saves can be made to fail
#[derive(Default)]
struct FlakyStore {
    inner: InMemoryPluginStore,
    fail_saves: AtomicBool,
}

#[async_trait]
impl PluginStore for FlakyStore {
    async fn find_by_id(&self, id: Uuid, tenant_id: &str) -> PluginResult<Option<Plugin>> {
        self.inner.find_by_id(id, tenant_id).await
    }

    async fn find_by_name(&self, tenant_id: &str, name: &str) -> PluginResult<Option<Plugin>> {
        self.inner.find_by_name(tenant_id, name).await
    }

    async fn find_all(&self, tenant_id: &str) -> PluginResult<Vec<Plugin>> {
        self.inner.find_all(tenant_id).await
    }

    async fn save(&self, plugin: &Plugin) -> PluginResult<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(PluginError::Store("disk full".into()));
        }
        self.inner.save(plugin).await
    }

    async fn delete(&self, id: Uuid, tenant_id: &str) -> PluginResult<bool> {
        self.inner.delete(id, tenant_id).await
    }
}

#[tokio::test]
async fn test_failed_deactivation_save_keeps_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let config = PluginConfig::with_data_dir(dir.path());
    let store = Arc::new(FlakyStore::default());
    let h = Harness::build(dir, config, store.clone()).await;
    let probe = h.register("crm-sync", HookBehaviour::Succeed);

    let plugin = h
        .manager
        .install(package(&manifest("crm-sync", "1.0.0"), &[]), TENANT)
        .await
        .unwrap();
    h.manager.activate(plugin.id, TENANT).await.unwrap();

    store.fail_saves.store(true, Ordering::SeqCst);
    let err = h.manager.deactivate(plugin.id, TENANT).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);

    // Store and runtime registry still agree
    let stored = h.manager.get_plugin(plugin.id, TENANT).await.unwrap();
    assert_eq!(stored.status, PluginStatus::Active);
    assert!(h.manager.get_runtime(plugin.id).is_some());
    assert_eq!(Probe::count(&probe.cleaned_up), 0);
    let response = h
        .manager
        .handle_api_request(plugin.id, TENANT, ApiRequest::new("GET", "/contacts"))
        .await
        .unwrap();
    assert_eq!(response.status, 200);

    store.fail_saves.store(false, Ordering::SeqCst);
    let inactive = h.manager.deactivate(plugin.id, TENANT).await.unwrap();
    assert_eq!(inactive.status, PluginStatus::Inactive);
    assert!(h.manager.get_runtime(plugin.id).is_none());
    assert_eq!(Probe::count(&probe.cleaned_up), 1);
}

#[tokio::test]
async fn test_ui_resources_are_permission_gated() {
    let h = Harness::new().await;
    h.register("crm-sync", HookBehaviour::Succeed);
    let mut raw = manifest("crm-sync", "1.0.0");
    raw["permissions"]["ui"] = serde_json::json!({ "components": ["ContactCard"] });
    let plugin = h.manager.install(package(&raw, &[]), TENANT).await.unwrap();

    let err = h
        .manager
        .authorize_ui(plugin.id, TENANT, UiResource::Component, "ContactCard")
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::NotLoaded(_)));

    h.manager.activate(plugin.id, TENANT).await.unwrap();
    h.manager
        .authorize_ui(plugin.id, TENANT, UiResource::Component, "ContactCard")
        .await
        .unwrap();

    for (resource, name) in [
        (UiResource::Page, "ContactCard"),
        (UiResource::Component, "InvoiceTable"),
    ] {
        let err = h
            .manager
            .authorize_ui(plugin.id, TENANT, resource, name)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }
}
