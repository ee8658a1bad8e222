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

//! Plugin manager - main entry point for plugin operations
//!
//! Orchestrates the plugin lifecycle: install, activate, deactivate and
//! uninstall, plus restoring Active plugins after a restart.
//!
//! Every transition on a plugin id holds that id's lock, so two transitions
//! on the same plugin never interleave. Lifecycle hooks run against a fresh
//! instance of the plugin's entry point and can never fail a transition.

use crate::archive::PluginArchive;
use crate::checker;
use crate::config::PluginConfig;
use crate::context::{HostServices, PluginContext};
use crate::entry::{invoke_hook, ApiRequest, ApiResponse};
use crate::error::{HookError, PluginError, PluginResult};
use crate::events::{EventBus, PluginEvent, PluginEventType};
use crate::loader::EntryLoader;
use crate::manifest::LifecycleHook;
use crate::permissions::UiResource;
use crate::resolver::{DependencyResolver, InstalledPlugin};
use crate::runtime::{PluginRuntime, RuntimeLoader};
use crate::store::{Plugin, PluginStatus, PluginStore};
use crate::validator::SecurityValidator;
use dashmap::DashMap;
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome of [`PluginManager::restore_active`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreSummary {
    /// Plugins loaded back into the runtime registry, in load order
    pub restored: Vec<String>,
    /// Plugins moved to Error, with the failure message
    pub failed: Vec<(String, String)>,
}

/// Plugin manager
pub struct PluginManager {
    config: PluginConfig,
    store: Arc<dyn PluginStore>,
    runtime: RuntimeLoader,
    resolver: DependencyResolver,
    validator: SecurityValidator,
    events: EventBus,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl PluginManager {
    /// Create a new plugin manager
    pub async fn new(
        config: PluginConfig,
        store: Arc<dyn PluginStore>,
        entry_loader: Arc<dyn EntryLoader>,
        services: HostServices,
    ) -> PluginResult<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(config.plugins_dir()).await?;

        let resolver = DependencyResolver::new(config.system_version()?);
        let validator = SecurityValidator::new(config.limits.clone());

        info!(
            plugins_dir = %config.plugins_dir().display(),
            system_version = %config.system_version,
            "Plugin manager initialized"
        );

        Ok(Self {
            config,
            store,
            runtime: RuntimeLoader::new(entry_loader, services),
            resolver,
            validator,
            events: EventBus::new(),
            locks: DashMap::new(),
        })
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    /// Lifecycle event bus; attach an [`AuditLogger`](crate::audit::AuditLogger) here
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn validator(&self) -> &SecurityValidator {
        &self.validator
    }

    pub fn resolver(&self) -> &DependencyResolver {
        &self.resolver
    }

    /// Install a plugin package for a tenant
    pub async fn install(&self, archive_bytes: Vec<u8>, tenant_id: &str) -> PluginResult<Plugin> {
        let started = Instant::now();
        match self.install_package(archive_bytes, tenant_id).await {
            Ok(plugin) => {
                info!(
                    plugin = plugin.name(),
                    plugin_id = %plugin.id,
                    tenant = tenant_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Plugin installed"
                );
                Ok(plugin)
            }
            Err((name, e)) => {
                self.emit_failure("install", None, name.as_deref().unwrap_or("<unknown>"), tenant_id, &e);
                Err(e)
            }
        }
    }

    async fn install_package(
        &self,
        archive_bytes: Vec<u8>,
        tenant_id: &str,
    ) -> Result<Plugin, (Option<String>, PluginError)> {
        let tenant_dir = self.tenant_dir(tenant_id).map_err(|e| (None, e))?;
        let archive = PluginArchive::from_bytes(archive_bytes).map_err(|e| (None, e))?;
        let manifest = archive.manifest().map_err(|e| (None, e))?;
        let name = manifest.name.clone();
        let named = |e: PluginError| (Some(name.clone()), e);

        let report = self.validator.validate_package(&archive, &manifest);
        for warning in &report.warnings {
            warn!(plugin = %name, tenant = tenant_id, "{}", warning);
        }
        report.into_result().map_err(named)?;

        if self
            .store
            .find_by_name(tenant_id, &name)
            .await
            .map_err(named)?
            .is_some()
        {
            return Err(named(PluginError::AlreadyInstalled(name.clone())));
        }

        let installed = self.installed_plugins(tenant_id, None).await.map_err(named)?;
        let resolution = self.resolver.resolve(&manifest, &installed);
        resolution.into_result(&name).map_err(named)?;

        let id = Uuid::new_v4();
        let install_path = tenant_dir.join(id.to_string());
        self.extract(archive, &install_path).await.map_err(named)?;

        let plugin = Plugin::new(id, tenant_id, manifest, install_path.clone());
        if let Err(e) = self.verify_entry(&plugin).await {
            remove_install_dir(&install_path).await;
            return Err(named(e));
        }

        if let Err(e) = self.store.save(&plugin).await {
            remove_install_dir(&install_path).await;
            return Err(named(e));
        }

        self.run_hook(&plugin, LifecycleHook::OnInstall).await;
        self.emit(
            PluginEventType::Installed,
            &plugin,
            serde_json::json!({ "version": plugin.version() }),
        );
        Ok(plugin)
    }

    /// Extract on a blocking thread; a partial tree is removed on failure
    async fn extract(&self, archive: PluginArchive, install_path: &Path) -> PluginResult<()> {
        let dest = install_path.to_path_buf();
        let result = tokio::task::spawn_blocking(move || archive.extract_to(&dest))
            .await
            .map_err(|e| PluginError::Host(format!("extraction task failed: {e}")))
            .and_then(|r| r);

        match result {
            Ok(files) => {
                debug!(path = %install_path.display(), files, "Extracted plugin package");
                Ok(())
            }
            Err(e) => {
                remove_install_dir(install_path).await;
                Err(e)
            }
        }
    }

    /// Tenant's directory under the plugins dir; the tenant id must be a
    /// single plain path component
    fn tenant_dir(&self, tenant_id: &str) -> PluginResult<PathBuf> {
        let mut components = Path::new(tenant_id).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(c)), None) if c == tenant_id => {
                Ok(self.config.plugins_dir().join(tenant_id))
            }
            _ => Err(PluginError::InvalidTenant(tenant_id.to_string())),
        }
    }

    async fn verify_entry(&self, plugin: &Plugin) -> PluginResult<()> {
        let entry = plugin.entry_path();
        match tokio::fs::metadata(&entry).await {
            Ok(meta) if meta.is_file() => Ok(()),
            _ => Err(PluginError::EntryPointMissing(entry.display().to_string())),
        }
    }

    /// Load the plugin into the runtime registry and mark it Active
    pub async fn activate(&self, id: Uuid, tenant_id: &str) -> PluginResult<Plugin> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut plugin = self.find(id, tenant_id).await?;
        if plugin.status == PluginStatus::Active {
            if !self.runtime.registry().contains(id) {
                // Active in the store but not in this process
                self.runtime.load(&plugin).await?;
            }
            debug!(plugin = plugin.name(), plugin_id = %id, "Plugin already active");
            return Ok(plugin);
        }

        if let Err(e) = self.runtime.load(&plugin).await {
            self.emit_failure("activate", Some(id), plugin.name(), tenant_id, &e);
            return Err(e);
        }

        plugin.set_status(PluginStatus::Active);
        if let Err(e) = self.store.save(&plugin).await {
            self.runtime.unload(id).await;
            return Err(e);
        }

        self.run_hook(&plugin, LifecycleHook::OnActivate).await;
        self.emit(PluginEventType::Activated, &plugin, serde_json::Value::Null);
        info!(plugin = plugin.name(), plugin_id = %id, tenant = tenant_id, "Plugin activated");
        Ok(plugin)
    }

    /// Unload the plugin's runtime and mark it Inactive
    pub async fn deactivate(&self, id: Uuid, tenant_id: &str) -> PluginResult<Plugin> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut plugin = self.find(id, tenant_id).await?;
        if plugin.status == PluginStatus::Inactive {
            debug!(plugin = plugin.name(), plugin_id = %id, "Plugin already inactive");
            return Ok(plugin);
        }

        self.deactivate_locked(&mut plugin).await?;
        Ok(plugin)
    }

    async fn deactivate_locked(&self, plugin: &mut Plugin) -> PluginResult<()> {
        if plugin.status == PluginStatus::Active {
            self.run_hook(plugin, LifecycleHook::OnDeactivate).await;
        }
        // Persist first: a failed save must leave the runtime loaded
        let previous = plugin.clone();
        plugin.set_status(PluginStatus::Inactive);
        if let Err(e) = self.store.save(plugin).await {
            *plugin = previous;
            return Err(e);
        }
        self.runtime.unload(plugin.id).await;

        self.emit(PluginEventType::Deactivated, plugin, serde_json::Value::Null);
        info!(plugin = plugin.name(), plugin_id = %plugin.id, tenant = %plugin.tenant_id, "Plugin deactivated");
        Ok(())
    }

    /// Remove the plugin, its files and its record
    pub async fn uninstall(&self, id: Uuid, tenant_id: &str) -> PluginResult<()> {
        let lock = self.lock_for(id);
        let guard = lock.lock().await;

        let mut plugin = self.find(id, tenant_id).await?;

        let others = self.installed_plugins(tenant_id, Some(id)).await?;
        let dependents = self.resolver.dependents_of(plugin.name(), &others);
        if !dependents.is_empty() {
            let e = PluginError::HasDependents(dependents);
            self.emit_failure("uninstall", Some(id), plugin.name(), tenant_id, &e);
            return Err(e);
        }

        if plugin.status == PluginStatus::Active {
            self.deactivate_locked(&mut plugin).await?;
        }

        self.run_hook(&plugin, LifecycleHook::OnUninstall).await;
        remove_install_dir(&plugin.install_path).await;
        self.store.delete(id, tenant_id).await?;

        self.emit(PluginEventType::Uninstalled, &plugin, serde_json::Value::Null);
        info!(plugin = plugin.name(), plugin_id = %id, tenant = tenant_id, "Plugin uninstalled");

        drop(guard);
        self.locks.remove(&id);
        Ok(())
    }

    /// Reload every plugin recorded Active for the tenant, dependencies first.
    ///
    /// A plugin that fails to load is moved to Error with `last_error` set.
    pub async fn restore_active(&self, tenant_id: &str) -> PluginResult<RestoreSummary> {
        let active: Vec<Plugin> = self
            .store
            .find_all(tenant_id)
            .await?
            .into_iter()
            .filter(|p| p.status == PluginStatus::Active)
            .collect();

        let graph: Vec<InstalledPlugin> = active
            .iter()
            .filter_map(|p| InstalledPlugin::from_manifest(&p.manifest).ok())
            .collect();
        let order = match self.resolver.load_order(&graph) {
            Ok(order) => order,
            Err(e) => {
                warn!(tenant = tenant_id, error = %e, "Falling back to stored order");
                active.iter().map(|p| p.name().to_string()).collect()
            }
        };

        let mut summary = RestoreSummary::default();
        for name in order {
            let Some(plugin) = active.iter().find(|p| p.name() == name) else {
                continue;
            };
            let lock = self.lock_for(plugin.id);
            let _guard = lock.lock().await;

            match self.runtime.load(plugin).await {
                Ok(_) => summary.restored.push(name),
                Err(e) => {
                    warn!(plugin = %name, plugin_id = %plugin.id, tenant = tenant_id, error = %e, "Failed to restore plugin");
                    let mut failed = plugin.clone();
                    failed.mark_error(e.to_string());
                    self.store.save(&failed).await?;
                    self.emit_failure("restore", Some(plugin.id), &name, tenant_id, &e);
                    summary.failed.push((name, e.to_string()));
                }
            }
        }

        info!(
            tenant = tenant_id,
            restored = summary.restored.len(),
            failed = summary.failed.len(),
            "Restored active plugins"
        );
        Ok(summary)
    }

    /// Unload every runtime without touching recorded status
    pub async fn shutdown(&self) {
        let count = self.runtime.unload_all().await;
        info!(runtimes = count, "Plugin manager shut down");
    }

    /// Route an API call to an active plugin, gated by its API permissions
    pub async fn handle_api_request(
        &self,
        id: Uuid,
        tenant_id: &str,
        request: ApiRequest,
    ) -> PluginResult<ApiResponse> {
        let runtime = match self.runtime.get(id) {
            Some(runtime) if runtime.plugin.tenant_id == tenant_id => runtime,
            _ => {
                let plugin = self.find(id, tenant_id).await?;
                return Err(PluginError::NotLoaded(plugin.name().to_string()));
            }
        };

        if let Err(e) = checker::enforce_api(
            runtime.plugin.name(),
            &runtime.plugin.manifest.permissions,
            &request.path,
            &request.method,
        ) {
            warn!(plugin = runtime.plugin.name(), plugin_id = %id, tenant = tenant_id, error = %e, "API request denied");
            return Err(e);
        }

        runtime.handle(request).await
    }

    /// Check that an active plugin may contribute the named UI component or
    /// page before the host mounts it
    pub async fn authorize_ui(
        &self,
        id: Uuid,
        tenant_id: &str,
        resource: UiResource,
        name: &str,
    ) -> PluginResult<()> {
        let runtime = match self.runtime.get(id) {
            Some(runtime) if runtime.plugin.tenant_id == tenant_id => runtime,
            _ => {
                let plugin = self.find(id, tenant_id).await?;
                return Err(PluginError::NotLoaded(plugin.name().to_string()));
            }
        };

        let result = checker::enforce_ui(
            runtime.plugin.name(),
            &runtime.plugin.manifest.permissions,
            resource,
            name,
        );
        if let Err(e) = &result {
            warn!(plugin = runtime.plugin.name(), plugin_id = %id, tenant = tenant_id, error = %e, "UI resource denied");
        }
        result
    }

    pub async fn get_plugin(&self, id: Uuid, tenant_id: &str) -> PluginResult<Plugin> {
        self.find(id, tenant_id).await
    }

    pub async fn get_plugin_by_name(&self, tenant_id: &str, name: &str) -> PluginResult<Plugin> {
        self.store
            .find_by_name(tenant_id, name)
            .await?
            .ok_or_else(|| PluginError::NotFound(name.to_string()))
    }

    pub async fn list_plugins(&self, tenant_id: &str) -> PluginResult<Vec<Plugin>> {
        self.store.find_all(tenant_id).await
    }

    pub fn get_runtime(&self, id: Uuid) -> Option<Arc<PluginRuntime>> {
        self.runtime.get(id)
    }

    pub fn get_all_runtimes(&self) -> Vec<Arc<PluginRuntime>> {
        self.runtime.all()
    }

    pub fn active_count(&self) -> usize {
        self.runtime.registry().len()
    }

    /// Run a lifecycle hook against a fresh instance; the outcome is only logged
    async fn run_hook(&self, plugin: &Plugin, hook: LifecycleHook) {
        let started = Instant::now();
        match self.execute_hook(plugin, hook).await {
            Ok(()) => debug!(
                plugin = plugin.name(),
                plugin_id = %plugin.id,
                hook = %hook,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Hook completed"
            ),
            Err(e) => warn!(
                plugin = plugin.name(),
                plugin_id = %plugin.id,
                tenant = %plugin.tenant_id,
                hook = %hook,
                error = %e,
                "Hook failed"
            ),
        }
    }

    async fn execute_hook(&self, plugin: &Plugin, hook: LifecycleHook) -> Result<(), HookError> {
        if plugin.manifest.hook_export(hook).is_none() {
            return Ok(());
        }
        if !tokio::fs::try_exists(plugin.entry_path()).await.unwrap_or(false) {
            debug!(plugin = plugin.name(), hook = %hook, "Entry point absent, skipping hook");
            return Ok(());
        }

        let entry = self
            .runtime
            .load_entry(plugin)
            .await
            .map_err(|e| HookError::LoadFailed(e.to_string()))?;
        let context = Arc::new(PluginContext::new(plugin, self.runtime.services()));

        // The task owns the instance; a hook that outlives the timeout keeps
        // its library mapped until it returns.
        let task = tokio::spawn(async move { invoke_hook(entry.instance(), hook, context).await });
        execute_with_timeout(task, self.config.hook_timeout()).await
    }

    async fn find(&self, id: Uuid, tenant_id: &str) -> PluginResult<Plugin> {
        self.store
            .find_by_id(id, tenant_id)
            .await?
            .ok_or_else(|| PluginError::NotFound(id.to_string()))
    }

    /// Tenant's installed plugins as the resolver sees them
    async fn installed_plugins(
        &self,
        tenant_id: &str,
        exclude: Option<Uuid>,
    ) -> PluginResult<Vec<InstalledPlugin>> {
        self.store
            .find_all(tenant_id)
            .await?
            .iter()
            .filter(|p| Some(p.id) != exclude)
            .map(|p| InstalledPlugin::from_manifest(&p.manifest))
            .collect()
    }

    fn lock_for(&self, id: Uuid) -> Arc<Mutex<()>> {
        self.locks.entry(id).or_default().clone()
    }

    fn emit(&self, event_type: PluginEventType, plugin: &Plugin, metadata: serde_json::Value) {
        let event = PluginEvent::new(event_type, Some(plugin.id), plugin.name(), &plugin.tenant_id)
            .with_metadata(metadata);
        self.events.emit(&event);
    }

    fn emit_failure(
        &self,
        operation: &str,
        id: Option<Uuid>,
        name: &str,
        tenant_id: &str,
        error: &PluginError,
    ) {
        let event = PluginEvent::new(PluginEventType::Failed, id, name, tenant_id).with_metadata(
            serde_json::json!({
                "operation": operation,
                "error": error.to_string(),
            }),
        );
        self.events.emit(&event);
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("data_dir", &self.config.data_dir)
            .field("runtimes", &self.runtime.registry().len())
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

/// Await a hook task with an upper bound
async fn execute_with_timeout(
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
    timeout: Duration,
) -> Result<(), HookError> {
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(e))) => Err(HookError::ExecutionFailed(e.to_string())),
        Ok(Err(e)) => Err(HookError::ExecutionFailed(format!("hook panicked: {e}"))),
        Err(_) => Err(HookError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

async fn remove_install_dir(path: &Path) {
    let path: PathBuf = path.to_path_buf();
    match tokio::fs::remove_dir_all(&path).await {
        Ok(()) => debug!(path = %path.display(), "Removed plugin directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove plugin directory"),
    }
}
