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

//! Entry-point loaders
//!
//! Turn an installed plugin's backend entry into a live
//! [`PluginEntryPoint`] instance.

use crate::entry::{PluginEntryPoint, ABI_VERSION, ABI_VERSION_SYMBOL, ENTRY_SYMBOL};
use crate::error::{PluginError, PluginResult};
use crate::store::Plugin;
use libloading::{Library, Symbol};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// A loaded instance together with whatever keeps its code mapped.
///
/// Field order matters: the instance is dropped before the library.
pub struct LoadedEntry {
    instance: Arc<dyn PluginEntryPoint>,
    _library: Option<Arc<Library>>,
}

impl LoadedEntry {
    /// Wrap an in-process instance
    pub fn in_process(instance: Arc<dyn PluginEntryPoint>) -> Self {
        Self {
            instance,
            _library: None,
        }
    }

    pub fn instance(&self) -> &dyn PluginEntryPoint {
        self.instance.as_ref()
    }
}

/// Loads entry points
pub trait EntryLoader: Send + Sync {
    /// Load a fresh instance. `entry_path` is the resolved backend entry file.
    fn load(&self, plugin: &Plugin, entry_path: &Path) -> PluginResult<LoadedEntry>;
}

/// Loads `cdylib` plugins exporting the canonical constructor symbol
#[derive(Debug, Default)]
pub struct NativeEntryLoader;

impl NativeEntryLoader {
    pub fn new() -> Self {
        Self
    }
}

impl EntryLoader for NativeEntryLoader {
    fn load(&self, plugin: &Plugin, entry_path: &Path) -> PluginResult<LoadedEntry> {
        type AbiVersionFn = unsafe extern "C" fn() -> u32;
        type CreateFn = unsafe extern "C" fn() -> *mut Box<dyn PluginEntryPoint>;

        // SAFETY: loading runs the library's initializers; plugins are trusted
        // at the managed-runtime level only.
        let library = unsafe { Library::new(entry_path) }.map_err(|e| {
            PluginError::LoadFailed(format!("{}: {}", entry_path.display(), e))
        })?;

        let abi_version = {
            let symbol: Symbol<AbiVersionFn> = unsafe { library.get(ABI_VERSION_SYMBOL) }
                .map_err(|e| {
                    PluginError::LoadFailed(format!("{}: missing ABI version: {}", plugin.name(), e))
                })?;
            unsafe { symbol() }
        };
        if abi_version != ABI_VERSION {
            return Err(PluginError::LoadFailed(format!(
                "{}: ABI version {} does not match host version {}",
                plugin.name(),
                abi_version,
                ABI_VERSION
            )));
        }

        let raw = {
            let create: Symbol<CreateFn> = unsafe { library.get(ENTRY_SYMBOL) }.map_err(|e| {
                PluginError::LoadFailed(format!("{}: missing entry symbol: {}", plugin.name(), e))
            })?;
            panic::catch_unwind(AssertUnwindSafe(|| unsafe { create() })).map_err(|_| {
                PluginError::LoadFailed(format!("{}: constructor panicked", plugin.name()))
            })?
        };
        if raw.is_null() {
            return Err(PluginError::LoadFailed(format!(
                "{}: constructor returned null",
                plugin.name()
            )));
        }

        // SAFETY: produced by Box::into_raw in `export_plugin!`
        let boxed: Box<Box<dyn PluginEntryPoint>> = unsafe { Box::from_raw(raw) };
        debug!(plugin = plugin.name(), path = %entry_path.display(), "Loaded native plugin");

        Ok(LoadedEntry {
            instance: Arc::from(*boxed),
            _library: Some(Arc::new(library)),
        })
    }
}

/// Factory producing a fresh instance
pub type EntryFactory = Arc<dyn Fn() -> Box<dyn PluginEntryPoint> + Send + Sync>;

/// In-process loader keyed by plugin name, for built-in plugins and tests
#[derive(Default)]
pub struct StaticEntryLoader {
    factories: RwLock<HashMap<String, EntryFactory>>,
}

impl StaticEntryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for the plugin named `name`
    pub fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn PluginEntryPoint> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .insert(name.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }
}

impl EntryLoader for StaticEntryLoader {
    fn load(&self, plugin: &Plugin, _entry_path: &Path) -> PluginResult<LoadedEntry> {
        let factory = self
            .factories
            .read()
            .get(plugin.name())
            .cloned()
            .ok_or_else(|| {
                PluginError::LoadFailed(format!("No entry point registered for '{}'", plugin.name()))
            })?;
        let instance = panic::catch_unwind(AssertUnwindSafe(|| factory())).map_err(|_| {
            PluginError::LoadFailed(format!("{}: constructor panicked", plugin.name()))
        })?;
        Ok(LoadedEntry::in_process(Arc::from(instance)))
    }
}

impl std::fmt::Debug for StaticEntryLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        f.debug_struct("StaticEntryLoader")
            .field("plugins", &names)
            .finish()
    }
}
