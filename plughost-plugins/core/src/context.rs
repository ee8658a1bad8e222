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

//! Plugin context
//!
//! The only channel through which plugin code reaches the host. Each facet
//! re-checks the plugin's declared permissions on every call; there is no
//! cached grant and no way to obtain a facet without the checks.

use crate::checker;
use crate::error::{PluginError, PluginResult};
use crate::manifest::PluginManifest;
use crate::permissions::{DatabaseOperation, ModuleAction, PermissionSet};
use crate::store::Plugin;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Host database, as seen by plugins
#[async_trait]
pub trait DatabaseGateway: Send + Sync {
    async fn execute(
        &self,
        tenant_id: &str,
        table: &str,
        operation: DatabaseOperation,
        query: &str,
        params: &[serde_json::Value],
    ) -> PluginResult<serde_json::Value>;
}

/// Module definition handed to the host module registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleDefinition {
    pub name: String,
    pub description: String,
    pub version: String,
    pub patch_content: serde_json::Value,
    pub tenant: String,
}

/// Host module registry
#[async_trait]
pub trait ModuleRegistry: Send + Sync {
    /// Register a new module, returning the registry id
    async fn register_module(&self, id: &str, definition: ModuleDefinition) -> PluginResult<String>;

    /// Apply a plugin's patch to an existing module
    async fn extend_module(
        &self,
        tenant_id: &str,
        module_name: &str,
        plugin_name: &str,
        patch: serde_json::Value,
    ) -> PluginResult<()>;
}

/// Host collaborators injected into every context
#[derive(Clone)]
pub struct HostServices {
    pub database: Arc<dyn DatabaseGateway>,
    pub modules: Arc<dyn ModuleRegistry>,
}

impl Default for HostServices {
    fn default() -> Self {
        Self {
            database: Arc::new(InMemoryDatabase::default()),
            modules: Arc::new(InMemoryModuleRegistry::default()),
        }
    }
}

/// Identity and permissions shared by every facet of one context
#[derive(Debug)]
struct Scope {
    plugin_id: Option<Uuid>,
    plugin_name: String,
    tenant_id: String,
    version: String,
    permissions: PermissionSet,
}

impl Scope {
    fn log_denial(&self, result: PluginResult<()>) -> PluginResult<()> {
        if let Err(e) = &result {
            warn!(plugin = %self.plugin_name, tenant = %self.tenant_id, error = %e, "Plugin access denied");
        }
        result
    }
}

/// Capability object handed to plugin code
pub struct PluginContext {
    database: DatabaseFacet,
    modules: ModulesFacet,
    logger: PluginLogger,
    metadata: PluginMetadata,
}

impl PluginContext {
    /// Context for an installed plugin
    pub fn new(plugin: &Plugin, services: &HostServices) -> Self {
        Self::for_manifest(Some(plugin.id), &plugin.tenant_id, &plugin.manifest, services)
    }

    pub fn for_manifest(
        plugin_id: Option<Uuid>,
        tenant_id: &str,
        manifest: &PluginManifest,
        services: &HostServices,
    ) -> Self {
        let scope = Arc::new(Scope {
            plugin_id,
            plugin_name: manifest.name.clone(),
            tenant_id: tenant_id.to_string(),
            version: manifest.version.clone(),
            permissions: manifest.permissions.clone(),
        });

        Self {
            database: DatabaseFacet {
                scope: scope.clone(),
                gateway: services.database.clone(),
            },
            modules: ModulesFacet {
                scope: scope.clone(),
                registry: services.modules.clone(),
            },
            logger: PluginLogger {
                scope: scope.clone(),
            },
            metadata: PluginMetadata {
                scope,
                config: manifest.config.clone().unwrap_or(serde_json::Value::Null),
            },
        }
    }

    pub fn database(&self) -> &DatabaseFacet {
        &self.database
    }

    pub fn modules(&self) -> &ModulesFacet {
        &self.modules
    }

    pub fn logger(&self) -> &PluginLogger {
        &self.logger
    }

    pub fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    /// Context with no permissions and in-memory host services
    #[cfg(test)]
    pub(crate) fn detached(name: &str, version: &str) -> Self {
        let raw = serde_json::json!({
            "name": name,
            "version": version,
            "type": "integration",
            "entry": { "backend": "index.js" }
        });
        let manifest = PluginManifest::parse(raw.to_string().as_bytes())
            .expect("detached context manifest");
        Self::for_manifest(None, "test", &manifest, &HostServices::default())
    }
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin", &self.metadata.scope.plugin_name)
            .field("tenant", &self.metadata.scope.tenant_id)
            .finish_non_exhaustive()
    }
}

/// `database` facet
#[derive(Clone)]
pub struct DatabaseFacet {
    scope: Arc<Scope>,
    gateway: Arc<dyn DatabaseGateway>,
}

impl DatabaseFacet {
    /// Run a query against `table`, gated on the `database` permission facet
    pub async fn execute_query(
        &self,
        table: &str,
        operation: DatabaseOperation,
        query: &str,
        params: &[serde_json::Value],
    ) -> PluginResult<serde_json::Value> {
        self.scope.log_denial(checker::enforce_database(
            &self.scope.plugin_name,
            &self.scope.permissions,
            table,
            operation,
        ))?;
        debug!(plugin = %self.scope.plugin_name, table, %operation, "Plugin database query");
        self.gateway
            .execute(&self.scope.tenant_id, table, operation, query, params)
            .await
    }

    /// Repository bound to one table; requires read access to obtain
    pub fn get_repository(&self, entity: &str, table: &str) -> PluginResult<ScopedRepository> {
        self.scope.log_denial(checker::enforce_database(
            &self.scope.plugin_name,
            &self.scope.permissions,
            table,
            DatabaseOperation::Read,
        ))?;
        Ok(ScopedRepository {
            entity: entity.to_string(),
            table: table.to_string(),
            facet: self.clone(),
        })
    }
}

/// Table-bound repository; every call is checked again
#[derive(Clone)]
pub struct ScopedRepository {
    entity: String,
    table: String,
    facet: DatabaseFacet,
}

impl std::fmt::Debug for ScopedRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedRepository")
            .field("entity", &self.entity)
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl ScopedRepository {
    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn find(&self, query: &str) -> PluginResult<serde_json::Value> {
        self.facet
            .execute_query(&self.table, DatabaseOperation::Read, query, &[])
            .await
    }

    pub async fn insert(&self, record: serde_json::Value) -> PluginResult<serde_json::Value> {
        self.facet
            .execute_query(&self.table, DatabaseOperation::Write, "insert", &[record])
            .await
    }

    pub async fn delete(&self, filter: serde_json::Value) -> PluginResult<serde_json::Value> {
        self.facet
            .execute_query(&self.table, DatabaseOperation::Delete, "delete", &[filter])
            .await
    }
}

/// `modules` facet
pub struct ModulesFacet {
    scope: Arc<Scope>,
    registry: Arc<dyn ModuleRegistry>,
}

impl ModulesFacet {
    /// Register a new module; requires `modules.create`
    pub async fn register(
        &self,
        name: &str,
        description: &str,
        patch_content: serde_json::Value,
    ) -> PluginResult<String> {
        self.scope.log_denial(checker::enforce_module(
            &self.scope.plugin_name,
            &self.scope.permissions,
            ModuleAction::Create,
            Some(name),
        ))?;

        // Module ids are tenant-scoped; two tenants may run the same plugin
        let id = format!(
            "{}:{}:{}",
            self.scope.tenant_id, self.scope.plugin_name, name
        );
        let definition = ModuleDefinition {
            name: name.to_string(),
            description: description.to_string(),
            version: self.scope.version.clone(),
            patch_content,
            tenant: self.scope.tenant_id.clone(),
        };
        let registry_id = self.registry.register_module(&id, definition).await?;
        info!(plugin = %self.scope.plugin_name, module = name, %registry_id, "Plugin registered module");
        Ok(registry_id)
    }

    /// Extend an existing module; requires the name in `modules.extend`
    pub async fn extend(&self, module_name: &str, patch: serde_json::Value) -> PluginResult<()> {
        self.scope.log_denial(checker::enforce_module(
            &self.scope.plugin_name,
            &self.scope.permissions,
            ModuleAction::Extend,
            Some(module_name),
        ))?;
        self.registry
            .extend_module(
                &self.scope.tenant_id,
                module_name,
                &self.scope.plugin_name,
                patch,
            )
            .await
    }
}

/// `logger` facet, namespaced by plugin
pub struct PluginLogger {
    scope: Arc<Scope>,
}

impl PluginLogger {
    pub fn debug(&self, message: &str) {
        debug!(target: "plughost::plugin", plugin = %self.scope.plugin_name, tenant = %self.scope.tenant_id, "{}", message);
    }

    pub fn info(&self, message: &str) {
        info!(target: "plughost::plugin", plugin = %self.scope.plugin_name, tenant = %self.scope.tenant_id, "{}", message);
    }

    pub fn warn(&self, message: &str) {
        warn!(target: "plughost::plugin", plugin = %self.scope.plugin_name, tenant = %self.scope.tenant_id, "{}", message);
    }

    pub fn error(&self, message: &str) {
        error!(target: "plughost::plugin", plugin = %self.scope.plugin_name, tenant = %self.scope.tenant_id, "{}", message);
    }
}

/// `metadata` facet, read-only
pub struct PluginMetadata {
    scope: Arc<Scope>,
    config: serde_json::Value,
}

impl PluginMetadata {
    pub fn plugin_id(&self) -> Option<Uuid> {
        self.scope.plugin_id
    }

    pub fn name(&self) -> &str {
        &self.scope.plugin_name
    }

    pub fn version(&self) -> &str {
        &self.scope.version
    }

    pub fn tenant_id(&self) -> &str {
        &self.scope.tenant_id
    }

    pub fn config(&self) -> &serde_json::Value {
        &self.config
    }

    /// Top-level config value by key
    pub fn config_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.config.get(key)
    }
}

/// In-memory [`DatabaseGateway`]: rows are JSON objects per (tenant, table).
///
/// `Write` appends each param as a row; `Read` returns all rows; `Delete`
/// removes rows whose fields match the first param (all rows without one).
#[derive(Debug, Default)]
pub struct InMemoryDatabase {
    tables: RwLock<HashMap<(String, String), Vec<serde_json::Value>>>,
}

#[async_trait]
impl DatabaseGateway for InMemoryDatabase {
    async fn execute(
        &self,
        tenant_id: &str,
        table: &str,
        operation: DatabaseOperation,
        _query: &str,
        params: &[serde_json::Value],
    ) -> PluginResult<serde_json::Value> {
        let key = (tenant_id.to_string(), table.to_string());
        match operation {
            DatabaseOperation::Read => {
                let tables = self.tables.read();
                let rows = tables.get(&key).cloned().unwrap_or_default();
                Ok(serde_json::Value::Array(rows))
            }
            DatabaseOperation::Write => {
                let mut tables = self.tables.write();
                tables.entry(key).or_default().extend(params.iter().cloned());
                Ok(serde_json::json!({ "affected": params.len() }))
            }
            DatabaseOperation::Delete => {
                let mut tables = self.tables.write();
                let rows = tables.entry(key).or_default();
                let before = rows.len();
                match params.first().and_then(|f| f.as_object()) {
                    Some(filter) => rows.retain(|row| {
                        !filter.iter().all(|(k, v)| row.get(k) == Some(v))
                    }),
                    None => rows.clear(),
                }
                Ok(serde_json::json!({ "affected": before - rows.len() }))
            }
        }
    }
}

/// In-memory [`ModuleRegistry`]
#[derive(Debug, Default)]
pub struct InMemoryModuleRegistry {
    modules: RwLock<HashMap<String, ModuleDefinition>>,
    extensions: RwLock<Vec<(String, String, String, serde_json::Value)>>,
}

impl InMemoryModuleRegistry {
    pub fn get(&self, id: &str) -> Option<ModuleDefinition> {
        self.modules.read().get(id).cloned()
    }

    /// (tenant, module, plugin) triples of applied extensions
    pub fn extensions(&self) -> Vec<(String, String, String)> {
        self.extensions
            .read()
            .iter()
            .map(|(t, m, p, _)| (t.clone(), m.clone(), p.clone()))
            .collect()
    }
}

#[async_trait]
impl ModuleRegistry for InMemoryModuleRegistry {
    async fn register_module(&self, id: &str, definition: ModuleDefinition) -> PluginResult<String> {
        let mut modules = self.modules.write();
        if modules.contains_key(id) {
            return Err(PluginError::Host(format!("Module '{}' already registered", id)));
        }
        modules.insert(id.to_string(), definition);
        Ok(id.to_string())
    }

    async fn extend_module(
        &self,
        tenant_id: &str,
        module_name: &str,
        plugin_name: &str,
        patch: serde_json::Value,
    ) -> PluginResult<()> {
        self.extensions.write().push((
            tenant_id.to_string(),
            module_name.to_string(),
            plugin_name.to_string(),
            patch,
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(permissions: serde_json::Value, services: &HostServices) -> PluginContext {
        context_for("tenant-a", permissions, services)
    }

    fn context_for(
        tenant: &str,
        permissions: serde_json::Value,
        services: &HostServices,
    ) -> PluginContext {
        let raw = json!({
            "name": "crm",
            "version": "2.1.0",
            "type": "integration",
            "entry": { "backend": "index.js" },
            "permissions": permissions,
            "config": { "batchSize": 25 }
        });
        let manifest = PluginManifest::parse(raw.to_string().as_bytes()).unwrap();
        PluginContext::for_manifest(Some(Uuid::new_v4()), tenant, &manifest, services)
    }

    #[tokio::test]
    async fn test_database_without_facet_is_denied() {
        let ctx = context(json!({}), &HostServices::default());
        for table in ["users", "contacts", "anything"] {
            for op in [DatabaseOperation::Read, DatabaseOperation::Write, DatabaseOperation::Delete] {
                let err = ctx.database().execute_query(table, op, "", &[]).await.unwrap_err();
                assert!(matches!(err, PluginError::PermissionDenied { .. }));
            }
        }
        assert!(ctx.database().get_repository("User", "users").is_err());
    }

    #[tokio::test]
    async fn test_database_gated_by_table_and_operation() {
        let ctx = context(
            json!({ "database": { "tables": ["contacts"], "operations": ["read", "write"] } }),
            &HostServices::default(),
        );
        let db = ctx.database();
        db.execute_query("contacts", DatabaseOperation::Write, "insert", &[json!({"id": 1})])
            .await
            .unwrap();
        let rows = db
            .execute_query("contacts", DatabaseOperation::Read, "select", &[])
            .await
            .unwrap();
        assert_eq!(rows, json!([{ "id": 1 }]));

        assert!(db
            .execute_query("contacts", DatabaseOperation::Delete, "", &[])
            .await
            .is_err());
        assert!(db
            .execute_query("users", DatabaseOperation::Read, "", &[])
            .await
            .is_err());

        let repo = db.get_repository("Contact", "contacts").unwrap();
        repo.insert(json!({"id": 2})).await.unwrap();
        assert_eq!(repo.find("").await.unwrap().as_array().unwrap().len(), 2);
        assert!(matches!(
            repo.delete(json!({"id": 1})).await,
            Err(PluginError::PermissionDenied { .. })
        ));
    }

    #[tokio::test]
    async fn test_modules_facet() {
        let registry = Arc::new(InMemoryModuleRegistry::default());
        let services = HostServices {
            database: Arc::new(InMemoryDatabase::default()),
            modules: registry.clone(),
        };

        let limited = context(json!({ "modules": { "extend": ["contacts"] } }), &services);
        assert!(limited.modules().register("leads", "Leads", json!({})).await.is_err());
        limited.modules().extend("contacts", json!({"field": "score"})).await.unwrap();
        assert!(limited.modules().extend("invoices", json!({})).await.is_err());
        assert_eq!(
            registry.extensions(),
            vec![("tenant-a".to_string(), "contacts".to_string(), "crm".to_string())]
        );

        let creator = context(json!({ "modules": { "create": true } }), &services);
        let id = creator.modules().register("leads", "Leads", json!({})).await.unwrap();
        let def = registry.get(&id).unwrap();
        assert_eq!(def.version, "2.1.0");
        assert_eq!(def.tenant, "tenant-a");
        assert!(creator.modules().register("leads", "Leads", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_same_module_in_two_tenants() {
        let registry = Arc::new(InMemoryModuleRegistry::default());
        let services = HostServices {
            database: Arc::new(InMemoryDatabase::default()),
            modules: registry.clone(),
        };
        let permissions = json!({ "modules": { "create": true } });

        let a = context_for("tenant-a", permissions.clone(), &services);
        let b = context_for("tenant-b", permissions, &services);
        let id_a = a.modules().register("leads", "Leads", json!({})).await.unwrap();
        let id_b = b.modules().register("leads", "Leads", json!({})).await.unwrap();

        assert_ne!(id_a, id_b);
        assert_eq!(registry.get(&id_a).unwrap().tenant, "tenant-a");
        assert_eq!(registry.get(&id_b).unwrap().tenant, "tenant-b");
    }

    #[test]
    fn test_metadata_facet() {
        let ctx = context(json!({}), &HostServices::default());
        assert_eq!(ctx.metadata().name(), "crm");
        assert_eq!(ctx.metadata().version(), "2.1.0");
        assert_eq!(ctx.metadata().config_value("batchSize"), Some(&json!(25)));
        ctx.logger().info("hello from the plugin");
    }
}
