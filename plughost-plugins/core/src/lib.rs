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

//! Plughost Plugin System
//!
//! Lifecycle and runtime management for tenant-scoped plugins packaged as ZIP
//! archives with a `manifest.json` at the root.
//!
//! # Architecture
//!
//! - **Validation**: size limits, file allow-list and static code scanning
//!   before anything touches disk
//! - **Resolution**: semver dependency checks and cycle detection
//! - **Lifecycle**: install, activate, deactivate, uninstall with per-plugin
//!   serialization and best-effort lifecycle hooks
//! - **Runtime**: loaded entry points, routed API handlers and a
//!   permission-gated [`PluginContext`]
//! - **Events**: an in-process bus with an append-only JSONL audit log
//!
//! # Example
//!
//! ```rust,ignore
//! use plughost_plugins::{
//!     HostServices, InMemoryPluginStore, NativeEntryLoader, PluginConfig, PluginManager,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = PluginManager::new(
//!         PluginConfig::default(),
//!         Arc::new(InMemoryPluginStore::new()),
//!         Arc::new(NativeEntryLoader::new()),
//!         HostServices::default(),
//!     )
//!     .await?;
//!
//!     let bytes = std::fs::read("crm-sync.zip")?;
//!     let plugin = manager.install(bytes, "acme").await?;
//!     manager.activate(plugin.id, "acme").await?;
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod audit;
pub mod checker;
pub mod config;
pub mod context;
pub mod entry;
pub mod error;
pub mod events;
pub mod loader;
pub mod manager;
pub mod manifest;
pub mod permissions;
pub mod resolver;
pub mod runtime;
pub mod store;
pub mod telemetry;
pub mod validator;

// Re-exports
pub use archive::{ArchiveEntry, PluginArchive};
pub use audit::{AuditEntry, AuditLogger, AuditQuery};
pub use config::PluginConfig;
pub use context::{
    DatabaseFacet, DatabaseGateway, HostServices, InMemoryDatabase, InMemoryModuleRegistry,
    ModuleDefinition, ModuleRegistry, ModulesFacet, PluginContext, PluginLogger, PluginMetadata,
    ScopedRepository,
};
pub use entry::{
    invoke_hook, ApiHandler, ApiRequest, ApiResponse, PluginEntryPoint, RouteHandler,
};
pub use error::{ErrorKind, HookError, PluginError, PluginResult};
pub use events::{
    EventBus, EventFilter, PluginEvent, PluginEventType, Subscription, SubscriptionId,
};
pub use loader::{EntryLoader, LoadedEntry, NativeEntryLoader, StaticEntryLoader};
pub use manager::{PluginManager, RestoreSummary};
pub use manifest::{LifecycleHook, PluginManifest, PluginType, SystemRequirement, VersionRange};
pub use permissions::{DatabaseOperation, GlobPattern, ModuleAction, PermissionSet, UiResource};
pub use resolver::{DependencyResolver, InstalledPlugin, Resolution};
pub use runtime::{PluginRuntime, RuntimeLoader, RuntimeRegistry};
pub use store::{InMemoryPluginStore, JsonFilePluginStore, Plugin, PluginStatus, PluginStore};
pub use validator::{SecurityValidator, ValidationLimits, ValidationReport};

/// Plugin manifest filename, at the archive root
pub const MANIFEST_FILENAME: &str = "manifest.json";

/// Default plugins directory name
pub const PLUGINS_DIR_NAME: &str = "plugins";

/// Plugin store file under the data directory
pub const STORE_FILENAME: &str = "plugins.json";

/// Audit log file under the data directory
pub const AUDIT_LOG_FILENAME: &str = "audit.jsonl";
