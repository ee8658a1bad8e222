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

//! Plugin records and their persistence
//!
//! The orchestrator only talks to [`PluginStore`]. Each call is atomic on its
//! own; there are no cross-call transactions. `save` is an upsert by id and is
//! the single place the (tenant, name) uniqueness rule is enforced.

use crate::error::{PluginError, PluginResult};
use crate::manifest::PluginManifest;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Plugin status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    /// Installed but never activated
    Installed,
    /// Loaded into the runtime registry
    Active,
    /// Deactivated
    Inactive,
    /// Failed to come back after a restart
    Error,
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginStatus::Installed => write!(f, "installed"),
            PluginStatus::Active => write!(f, "active"),
            PluginStatus::Inactive => write!(f, "inactive"),
            PluginStatus::Error => write!(f, "error"),
        }
    }
}

/// An installed plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plugin {
    pub id: Uuid,
    pub tenant_id: String,
    pub manifest: PluginManifest,
    pub status: PluginStatus,
    pub install_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Plugin {
    pub fn new(id: Uuid, tenant_id: &str, manifest: PluginManifest, install_path: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id,
            tenant_id: tenant_id.to_string(),
            manifest,
            status: PluginStatus::Installed,
            install_path,
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn version(&self) -> &str {
        &self.manifest.version
    }

    /// Change status and bump `updated_at`. Leaving Error clears `last_error`.
    pub fn set_status(&mut self, status: PluginStatus) {
        self.status = status;
        if status != PluginStatus::Error {
            self.last_error = None;
        }
        self.updated_at = Utc::now();
    }

    pub fn mark_error(&mut self, error: impl Into<String>) {
        self.set_status(PluginStatus::Error);
        self.last_error = Some(error.into());
    }

    /// Absolute path of the backend entry point
    pub fn entry_path(&self) -> PathBuf {
        self.install_path.join(&self.manifest.entry.backend)
    }
}

/// Persistence interface consumed by the orchestrator
#[async_trait]
pub trait PluginStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid, tenant_id: &str) -> PluginResult<Option<Plugin>>;

    async fn find_by_name(&self, tenant_id: &str, name: &str) -> PluginResult<Option<Plugin>>;

    /// All plugins of a tenant, oldest first
    async fn find_all(&self, tenant_id: &str) -> PluginResult<Vec<Plugin>>;

    /// Upsert by id. Fails with [`PluginError::AlreadyInstalled`] if another
    /// record holds the same (tenant, name).
    async fn save(&self, plugin: &Plugin) -> PluginResult<()>;

    /// Returns whether a record was removed
    async fn delete(&self, id: Uuid, tenant_id: &str) -> PluginResult<bool>;
}

/// Shared record table used by both store implementations
#[derive(Debug, Default, Serialize, Deserialize)]
struct PluginTable {
    plugins: HashMap<Uuid, Plugin>,
}

impl PluginTable {
    fn find_by_id(&self, id: Uuid, tenant_id: &str) -> Option<Plugin> {
        self.plugins
            .get(&id)
            .filter(|p| p.tenant_id == tenant_id)
            .cloned()
    }

    fn find_by_name(&self, tenant_id: &str, name: &str) -> Option<Plugin> {
        self.plugins
            .values()
            .find(|p| p.tenant_id == tenant_id && p.name() == name)
            .cloned()
    }

    fn find_all(&self, tenant_id: &str) -> Vec<Plugin> {
        let mut plugins: Vec<Plugin> = self
            .plugins
            .values()
            .filter(|p| p.tenant_id == tenant_id)
            .cloned()
            .collect();
        plugins.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name().cmp(b.name()))
        });
        plugins
    }

    fn upsert(&mut self, plugin: &Plugin) -> PluginResult<()> {
        let clash = self.plugins.values().any(|p| {
            p.id != plugin.id && p.tenant_id == plugin.tenant_id && p.name() == plugin.name()
        });
        if clash {
            return Err(PluginError::AlreadyInstalled(plugin.name().to_string()));
        }
        if let Some(existing) = self.plugins.get(&plugin.id) {
            if existing.tenant_id != plugin.tenant_id {
                return Err(PluginError::Store(format!(
                    "Plugin {} belongs to another tenant",
                    plugin.id
                )));
            }
        }
        self.plugins.insert(plugin.id, plugin.clone());
        Ok(())
    }

    fn remove(&mut self, id: Uuid, tenant_id: &str) -> bool {
        match self.plugins.get(&id) {
            Some(p) if p.tenant_id == tenant_id => {
                self.plugins.remove(&id);
                true
            }
            _ => false,
        }
    }
}

/// Process-local store
#[derive(Debug, Default)]
pub struct InMemoryPluginStore {
    table: RwLock<PluginTable>,
}

impl InMemoryPluginStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PluginStore for InMemoryPluginStore {
    async fn find_by_id(&self, id: Uuid, tenant_id: &str) -> PluginResult<Option<Plugin>> {
        Ok(self.table.read().find_by_id(id, tenant_id))
    }

    async fn find_by_name(&self, tenant_id: &str, name: &str) -> PluginResult<Option<Plugin>> {
        Ok(self.table.read().find_by_name(tenant_id, name))
    }

    async fn find_all(&self, tenant_id: &str) -> PluginResult<Vec<Plugin>> {
        Ok(self.table.read().find_all(tenant_id))
    }

    async fn save(&self, plugin: &Plugin) -> PluginResult<()> {
        self.table.write().upsert(plugin)
    }

    async fn delete(&self, id: Uuid, tenant_id: &str) -> PluginResult<bool> {
        Ok(self.table.write().remove(id, tenant_id))
    }
}

/// Store persisted as a single JSON snapshot.
///
/// Every mutation rewrites the snapshot through a temporary file and a rename,
/// so a crash leaves either the old or the new state on disk.
#[derive(Debug)]
pub struct JsonFilePluginStore {
    path: PathBuf,
    table: Mutex<PluginTable>,
}

impl JsonFilePluginStore {
    /// Open the snapshot at `path`, starting empty if it does not exist
    pub async fn open(path: impl Into<PathBuf>) -> PluginResult<Self> {
        let path = path.into();
        let table = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| PluginError::Store(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PluginTable::default(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), "Opened plugin store");
        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, table: &PluginTable) -> PluginResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(table)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl PluginStore for JsonFilePluginStore {
    async fn find_by_id(&self, id: Uuid, tenant_id: &str) -> PluginResult<Option<Plugin>> {
        Ok(self.table.lock().await.find_by_id(id, tenant_id))
    }

    async fn find_by_name(&self, tenant_id: &str, name: &str) -> PluginResult<Option<Plugin>> {
        Ok(self.table.lock().await.find_by_name(tenant_id, name))
    }

    async fn find_all(&self, tenant_id: &str) -> PluginResult<Vec<Plugin>> {
        Ok(self.table.lock().await.find_all(tenant_id))
    }

    async fn save(&self, plugin: &Plugin) -> PluginResult<()> {
        let mut table = self.table.lock().await;
        let previous = table.plugins.get(&plugin.id).cloned();
        table.upsert(plugin)?;
        if let Err(e) = self.persist(&table).await {
            // Keep memory consistent with disk
            match previous {
                Some(p) => {
                    table.plugins.insert(p.id, p);
                }
                None => {
                    table.plugins.remove(&plugin.id);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid, tenant_id: &str) -> PluginResult<bool> {
        let mut table = self.table.lock().await;
        let Some(previous) = table.find_by_id(id, tenant_id) else {
            return Ok(false);
        };
        table.remove(id, tenant_id);
        if let Err(e) = self.persist(&table).await {
            table.plugins.insert(previous.id, previous);
            return Err(e);
        }
        Ok(true)
    }
}
