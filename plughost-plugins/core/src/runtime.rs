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

//! Runtime loader and registry
//!
//! A [`PluginRuntime`] is the process-local materialization of an Active
//! plugin: its loaded instance, its context and its routes. Runtimes live in
//! the [`RuntimeRegistry`], which only the [`RuntimeLoader`] mutates.

use crate::context::{HostServices, PluginContext};
use crate::entry::{ApiHandler, ApiRequest, ApiResponse, RouteHandler};
use crate::error::{ErrorKind, PluginError, PluginResult};
use crate::loader::{EntryLoader, LoadedEntry};
use crate::store::Plugin;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A route served by a runtime
#[derive(Clone)]
pub struct RegisteredRoute {
    pub method: String,
    pub path: String,
    /// Whether the manifest declares this route
    pub declared: bool,
    handler: Arc<dyn ApiHandler>,
}

impl RegisteredRoute {
    /// Match a concrete path; `:name` segments capture parameters
    fn capture(&self, method: &str, path: &str) -> Option<HashMap<String, String>> {
        if !self.method.eq_ignore_ascii_case(method) {
            return None;
        }
        let pattern: Vec<&str> = self.path.trim_matches('/').split('/').collect();
        let actual: Vec<&str> = path.trim_matches('/').split('/').collect();
        if pattern.len() != actual.len() {
            return None;
        }

        let mut params = HashMap::new();
        for (p, a) in pattern.iter().zip(actual.iter()) {
            if let Some(name) = p.strip_prefix(':') {
                params.insert(name.to_string(), a.to_string());
            } else if p != a {
                return None;
            }
        }
        Some(params)
    }
}

impl std::fmt::Debug for RegisteredRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredRoute")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("declared", &self.declared)
            .finish()
    }
}

/// Handler for declared routes the plugin does not implement
struct NotImplemented;

#[async_trait]
impl ApiHandler for NotImplemented {
    async fn handle(&self, request: ApiRequest) -> anyhow::Result<ApiResponse> {
        Ok(ApiResponse::not_implemented(&request.method, &request.path))
    }
}

/// An active plugin
pub struct PluginRuntime {
    pub plugin: Plugin,
    pub context: Arc<PluginContext>,
    pub loaded_at: DateTime<Utc>,
    routes: Vec<RegisteredRoute>,
    // Dropped last so no plugin code outlives its library
    entry: LoadedEntry,
}

impl PluginRuntime {
    pub fn id(&self) -> Uuid {
        self.plugin.id
    }

    pub fn routes(&self) -> &[RegisteredRoute] {
        &self.routes
    }

    /// Dispatch a request to the matching route.
    ///
    /// Permission denials raised inside the handler surface as errors; any
    /// other handler failure becomes a 500 response.
    pub async fn handle(&self, mut request: ApiRequest) -> PluginResult<ApiResponse> {
        let (route, params) = self
            .routes
            .iter()
            .find_map(|r| r.capture(&request.method, &request.path).map(|p| (r, p)))
            .ok_or_else(|| PluginError::RouteNotFound {
                method: request.method.clone(),
                path: request.path.clone(),
            })?;
        request.params.extend(params);

        match route.handler.handle(request).await {
            Ok(response) => Ok(response),
            Err(e) => match e.downcast::<PluginError>() {
                Ok(err) if err.kind() == ErrorKind::PermissionDenied => Err(err),
                Ok(err) => Ok(internal_error(&err.to_string())),
                Err(other) => Ok(internal_error(&other.to_string())),
            },
        }
    }
}

fn internal_error(message: &str) -> ApiResponse {
    ApiResponse::with_status(500, serde_json::json!({ "error": message }))
}

impl std::fmt::Debug for PluginRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRuntime")
            .field("plugin", &self.plugin.name())
            .field("id", &self.plugin.id)
            .field("routes", &self.routes)
            .field("loaded_at", &self.loaded_at)
            .finish_non_exhaustive()
    }
}

/// Runtimes keyed by plugin id
#[derive(Debug, Default)]
pub struct RuntimeRegistry {
    runtimes: RwLock<HashMap<Uuid, Arc<PluginRuntime>>>,
}

impl RuntimeRegistry {
    pub fn get(&self, id: Uuid) -> Option<Arc<PluginRuntime>> {
        self.runtimes.read().get(&id).cloned()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.runtimes.read().contains_key(&id)
    }

    /// All runtimes, ordered by load time
    pub fn all(&self) -> Vec<Arc<PluginRuntime>> {
        let mut all: Vec<_> = self.runtimes.read().values().cloned().collect();
        all.sort_by_key(|r| r.loaded_at);
        all
    }

    pub fn len(&self) -> usize {
        self.runtimes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runtimes.read().is_empty()
    }

    fn insert(&self, runtime: Arc<PluginRuntime>) -> Option<Arc<PluginRuntime>> {
        self.runtimes.write().insert(runtime.id(), runtime)
    }

    fn remove(&self, id: Uuid) -> Option<Arc<PluginRuntime>> {
        self.runtimes.write().remove(&id)
    }

    fn drain(&self) -> Vec<Arc<PluginRuntime>> {
        self.runtimes.write().drain().map(|(_, r)| r).collect()
    }
}

/// Loads plugins into the registry and unloads them
pub struct RuntimeLoader {
    registry: RuntimeRegistry,
    loader: Arc<dyn EntryLoader>,
    services: HostServices,
}

impl RuntimeLoader {
    pub fn new(loader: Arc<dyn EntryLoader>, services: HostServices) -> Self {
        Self {
            registry: RuntimeRegistry::default(),
            loader,
            services,
        }
    }

    pub fn registry(&self) -> &RuntimeRegistry {
        &self.registry
    }

    pub fn services(&self) -> &HostServices {
        &self.services
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<PluginRuntime>> {
        self.registry.get(id)
    }

    pub fn all(&self) -> Vec<Arc<PluginRuntime>> {
        self.registry.all()
    }

    /// Load a fresh instance of the plugin's entry point.
    ///
    /// Runs on a blocking thread; fails with `EntryPointMissing` if the entry
    /// file is not on disk.
    pub async fn load_entry(&self, plugin: &Plugin) -> PluginResult<LoadedEntry> {
        let entry_path = plugin.entry_path();
        if !tokio::fs::try_exists(&entry_path).await.unwrap_or(false) {
            return Err(PluginError::EntryPointMissing(entry_path.display().to_string()));
        }

        let loader = Arc::clone(&self.loader);
        let owned = plugin.clone();
        tokio::task::spawn_blocking(move || loader.load(&owned, &entry_path))
            .await
            .map_err(|e| PluginError::LoadFailed(format!("{}: {}", plugin.name(), e)))?
    }

    /// Load, initialize and register a runtime. Replaces nothing: loading an
    /// id that is already registered returns the existing runtime.
    pub async fn load(&self, plugin: &Plugin) -> PluginResult<Arc<PluginRuntime>> {
        if let Some(existing) = self.registry.get(plugin.id) {
            return Ok(existing);
        }

        let entry = self.load_entry(plugin).await?;
        let context = Arc::new(PluginContext::new(plugin, &self.services));

        // Own the instance inside the task so a panic is contained
        let init_context = Arc::clone(&context);
        let (entry, init) = tokio::spawn(async move {
            let result = entry.instance().initialize(init_context).await;
            (entry, result)
        })
        .await
        .map_err(|e| {
            PluginError::LoadFailed(format!("{}: initialize panicked: {}", plugin.name(), e))
        })?;
        init.map_err(|e| {
            PluginError::LoadFailed(format!("{}: initialize failed: {}", plugin.name(), e))
        })?;

        let routes = harvest_routes(plugin, entry.instance().api_handlers());
        let runtime = Arc::new(PluginRuntime {
            plugin: plugin.clone(),
            context,
            loaded_at: Utc::now(),
            routes,
            entry,
        });

        self.registry.insert(Arc::clone(&runtime));
        info!(
            plugin = plugin.name(),
            plugin_id = %plugin.id,
            tenant = %plugin.tenant_id,
            routes = runtime.routes.len(),
            "Plugin runtime loaded"
        );
        Ok(runtime)
    }

    /// Remove a runtime and run its cleanup. Returns false if none was loaded.
    pub async fn unload(&self, id: Uuid) -> bool {
        let Some(runtime) = self.registry.remove(id) else {
            return false;
        };
        cleanup(runtime).await;
        true
    }

    /// Unload every runtime
    pub async fn unload_all(&self) -> usize {
        let runtimes = self.registry.drain();
        let count = runtimes.len();
        for runtime in runtimes {
            cleanup(runtime).await;
        }
        count
    }
}

async fn cleanup(runtime: Arc<PluginRuntime>) {
    let name = runtime.plugin.name().to_string();
    let id = runtime.id();
    let outcome = tokio::spawn(async move { runtime.entry.instance().cleanup().await }).await;
    match outcome {
        Ok(Ok(())) => debug!(plugin = %name, plugin_id = %id, "Plugin runtime unloaded"),
        Ok(Err(e)) => warn!(plugin = %name, plugin_id = %id, error = %e, "Plugin cleanup failed"),
        Err(e) => warn!(plugin = %name, plugin_id = %id, error = %e, "Plugin cleanup panicked"),
    }
}

/// Register provided handlers, flag undeclared ones, stub missing ones
fn harvest_routes(plugin: &Plugin, provided: Vec<RouteHandler>) -> Vec<RegisteredRoute> {
    let declared = plugin.manifest.routes();
    let is_declared = |method: &str, path: &str| {
        declared
            .iter()
            .any(|d| d.method.eq_ignore_ascii_case(method) && d.path == path)
    };

    let mut routes: Vec<RegisteredRoute> = Vec::with_capacity(provided.len().max(declared.len()));
    for handler in provided {
        let declared = is_declared(&handler.method, &handler.path);
        if !declared {
            warn!(
                plugin = plugin.name(),
                method = %handler.method,
                path = %handler.path,
                "Plugin registered a handler for an undeclared route"
            );
        }
        routes.push(RegisteredRoute {
            method: handler.method,
            path: handler.path,
            declared,
            handler: handler.handler,
        });
    }

    for route in declared {
        let provided = routes
            .iter()
            .any(|r| r.method.eq_ignore_ascii_case(&route.method) && r.path == route.path);
        if !provided {
            debug!(plugin = plugin.name(), method = %route.method, path = %route.path, "Stubbing unimplemented route");
            routes.push(RegisteredRoute {
                method: route.method.to_ascii_uppercase(),
                path: route.path.clone(),
                declared: true,
                handler: Arc::new(NotImplemented),
            });
        }
    }

    routes
}
