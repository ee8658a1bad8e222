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
use plughost_plugins::{
    JsonFilePluginStore, PluginConfig, PluginEventType, PluginStatus, PluginStore,
};
use std::sync::Arc;

async fn json_harness(dir: tempfile::TempDir) -> Harness {
    let config = PluginConfig::with_data_dir(dir.path());
    let store: Arc<dyn PluginStore> =
        Arc::new(JsonFilePluginStore::open(config.store_path()).await.unwrap());
    Harness::build(dir, config, store).await
}

#[tokio::test]
async fn test_restore_after_restart() {
    let first = json_harness(tempfile::tempdir().unwrap()).await;
    first.register("contacts", HookBehaviour::Succeed);
    first.register("contacts-sync", HookBehaviour::Succeed);
    first.register("legacy", HookBehaviour::Succeed);

    let base = first
        .manager
        .install(package(&manifest("contacts", "1.0.0"), &[]), TENANT)
        .await
        .unwrap();
    let mut addon = manifest("contacts-sync", "1.0.0");
    addon["dependencies"] = serde_json::json!({
        "plugins": [{ "name": "contacts", "version": "^1.0.0" }]
    });
    let addon = first.manager.install(package(&addon, &[]), TENANT).await.unwrap();
    let legacy = first
        .manager
        .install(package(&manifest("legacy", "1.0.0"), &[]), TENANT)
        .await
        .unwrap();
    let idle = first
        .manager
        .install(package(&manifest("idle", "1.0.0"), &[]), TENANT)
        .await
        .unwrap();

    // Activate the dependent first; restore must still load its dependency first
    for id in [addon.id, base.id, legacy.id] {
        first.manager.activate(id, TENANT).await.unwrap();
    }
    first.manager.shutdown().await;
    assert!(first.manager.get_all_runtimes().is_empty());

    // Runtime status survives shutdown
    let stored = first.manager.get_plugin(base.id, TENANT).await.unwrap();
    assert_eq!(stored.status, PluginStatus::Active);

    // "Restart": a new manager over the same data dir, without an entry for legacy
    let Harness { dir, manager, .. } = first;
    drop(manager);
    let second = json_harness(dir).await;
    let base_probe = second.register("contacts", HookBehaviour::Succeed);
    let addon_probe = second.register("contacts-sync", HookBehaviour::Succeed);

    let summary = second.manager.restore_active(TENANT).await.unwrap();
    assert_eq!(summary.restored, vec!["contacts".to_string(), "contacts-sync".to_string()]);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].0, "legacy");

    // Restoring re-initializes without replaying activation hooks
    assert_eq!(Probe::count(&base_probe.initialized), 1);
    assert_eq!(Probe::count(&base_probe.activations), 0);
    assert_eq!(Probe::count(&addon_probe.initialized), 1);
    assert!(second.manager.get_runtime(addon.id).is_some());

    let failed = second.manager.get_plugin(legacy.id, TENANT).await.unwrap();
    assert_eq!(failed.status, PluginStatus::Error);
    assert!(failed.last_error.is_some());
    assert_eq!(
        second.event_types(),
        vec![PluginEventType::Failed]
    );

    let untouched = second.manager.get_plugin(idle.id, TENANT).await.unwrap();
    assert_eq!(untouched.status, PluginStatus::Installed);
    assert!(second.manager.get_runtime(idle.id).is_none());

    // A plugin in Error can be activated again once its entry is available
    second.register("legacy", HookBehaviour::Succeed);
    let recovered = second.manager.activate(legacy.id, TENANT).await.unwrap();
    assert_eq!(recovered.status, PluginStatus::Active);
    assert!(recovered.last_error.is_none());
}

#[tokio::test]
async fn test_deactivate_in_a_later_process_runs_cleanup() {
    let first = json_harness(tempfile::tempdir().unwrap()).await;
    let probe = first.register("contacts", HookBehaviour::Succeed);
    let plugin = first
        .manager
        .install(package(&manifest("contacts", "1.0.0"), &[]), TENANT)
        .await
        .unwrap();
    first.manager.activate(plugin.id, TENANT).await.unwrap();
    first.manager.shutdown().await;
    assert_eq!(Probe::count(&probe.cleaned_up), 1);

    let Harness { dir, manager, .. } = first;
    drop(manager);
    let second = json_harness(dir).await;
    let probe = second.register("contacts", HookBehaviour::Succeed);

    second.manager.restore_active(TENANT).await.unwrap();
    let inactive = second.manager.deactivate(plugin.id, TENANT).await.unwrap();
    assert_eq!(inactive.status, PluginStatus::Inactive);
    assert_eq!(Probe::count(&probe.initialized), 1);
    assert_eq!(Probe::count(&probe.deactivations), 1);
    assert_eq!(Probe::count(&probe.cleaned_up), 1);

    second.manager.shutdown().await;
    assert_eq!(Probe::count(&probe.cleaned_up), 1);
}
