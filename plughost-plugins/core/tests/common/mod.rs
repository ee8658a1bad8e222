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

//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use plughost_plugins::{
    ApiResponse, DatabaseOperation, HostServices, InMemoryPluginStore, PluginConfig,
    PluginContext, PluginEntryPoint, PluginEventType, PluginManager, PluginStore, RouteHandler,
    StaticEntryLoader,
};
use serde_json::{json, Value};
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

pub const TENANT: &str = "acme";

pub const BACKEND: &str = "dist/index.js";

/// Counts every call a [`ProbePlugin`] instance receives
#[derive(Debug, Default)]
pub struct Probe {
    pub initialized: AtomicUsize,
    pub cleaned_up: AtomicUsize,
    pub installs: AtomicUsize,
    pub activations: AtomicUsize,
    pub deactivations: AtomicUsize,
    pub uninstalls: AtomicUsize,
}

impl Probe {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Behaviour knobs for [`ProbePlugin`]
#[derive(Debug, Clone, Copy, Default)]
pub enum HookBehaviour {
    #[default]
    Succeed,
    /// Every lifecycle hook returns an error
    Fail,
    /// Every lifecycle hook sleeps this long before succeeding
    Stall(Duration),
}

/// Test plugin recording its calls in a shared [`Probe`]
pub struct ProbePlugin {
    probe: Arc<Probe>,
    behaviour: HookBehaviour,
    context: OnceLock<Arc<PluginContext>>,
}

impl ProbePlugin {
    pub fn new(probe: Arc<Probe>, behaviour: HookBehaviour) -> Self {
        Self {
            probe,
            behaviour,
            context: OnceLock::new(),
        }
    }

    async fn hook(&self, counter: &AtomicUsize) -> anyhow::Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        match self.behaviour {
            HookBehaviour::Succeed => Ok(()),
            HookBehaviour::Fail => anyhow::bail!("hook rejected"),
            HookBehaviour::Stall(duration) => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl PluginEntryPoint for ProbePlugin {
    async fn initialize(&self, context: Arc<PluginContext>) -> anyhow::Result<()> {
        self.probe.initialized.fetch_add(1, Ordering::SeqCst);
        let _ = self.context.set(context);
        Ok(())
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        self.probe.cleaned_up.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn api_handlers(&self) -> Vec<RouteHandler> {
        let context = self.context.get().cloned();
        vec![
            RouteHandler::from_fn("GET", "/contacts", |_req| async {
                Ok(ApiResponse::ok(json!(["ada", "grace"])))
            }),
            RouteHandler::from_fn("GET", "/contacts/db", move |_req| {
                let context = context.clone();
                async move {
                    let context = context.ok_or_else(|| anyhow::anyhow!("not initialized"))?;
                    let rows = context
                        .database()
                        .execute_query("contacts", DatabaseOperation::Read, "select *", &[])
                        .await?;
                    Ok(ApiResponse::ok(rows))
                }
            }),
        ]
    }

    async fn on_install(&self, _context: Arc<PluginContext>) -> anyhow::Result<()> {
        self.hook(&self.probe.installs).await
    }

    async fn on_activate(&self, _context: Arc<PluginContext>) -> anyhow::Result<()> {
        self.hook(&self.probe.activations).await
    }

    async fn on_deactivate(&self, _context: Arc<PluginContext>) -> anyhow::Result<()> {
        self.hook(&self.probe.deactivations).await
    }

    async fn on_uninstall(&self, _context: Arc<PluginContext>) -> anyhow::Result<()> {
        self.hook(&self.probe.uninstalls).await
    }
}

/// Minimal valid manifest declaring every hook
pub fn manifest(name: &str, version: &str) -> Value {
    json!({
        "name": name,
        "version": version,
        "type": "integration",
        "description": "Test plugin",
        "entry": { "backend": BACKEND },
        "hooks": {
            "onInstall": "install",
            "onActivate": "activate",
            "onDeactivate": "deactivate",
            "onUninstall": "uninstall"
        },
        "api": { "routes": [
            { "path": "/contacts", "method": "GET", "handler": "listContacts" },
            { "path": "/contacts/db", "method": "GET", "handler": "readContacts" },
            { "path": "/contacts/export", "method": "POST", "handler": "exportContacts" }
        ] },
        "permissions": {
            "api": { "endpoints": ["/contacts", "/contacts/*"], "methods": ["GET"] }
        }
    })
}

/// Build a package from a manifest and extra files; the backend entry is
/// added with harmless content unless supplied.
pub fn package(manifest: &Value, files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();

    writer.start_file("manifest.json", options).unwrap();
    writer
        .write_all(serde_json::to_string_pretty(manifest).unwrap().as_bytes())
        .unwrap();

    if !files.iter().any(|(name, _)| *name == BACKEND) {
        writer.start_file(BACKEND, options).unwrap();
        writer.write_all(b"export default {};\n").unwrap();
    }
    for (name, content) in files {
        writer.start_file(*name, options).unwrap();
        writer.write_all(content).unwrap();
    }

    writer.finish().unwrap().into_inner()
}

/// A manager over a temp data dir with in-process entry points
pub struct Harness {
    pub dir: TempDir,
    pub manager: PluginManager,
    pub store: Arc<dyn PluginStore>,
    pub loader: Arc<StaticEntryLoader>,
    pub services: HostServices,
    pub events: Arc<Mutex<Vec<(PluginEventType, String)>>>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(configure: impl FnOnce(&mut PluginConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PluginConfig::with_data_dir(dir.path());
        configure(&mut config);
        let store: Arc<dyn PluginStore> = Arc::new(InMemoryPluginStore::new());
        Self::build(dir, config, store).await
    }

    pub async fn build(dir: TempDir, config: PluginConfig, store: Arc<dyn PluginStore>) -> Self {
        let loader = Arc::new(StaticEntryLoader::new());
        let services = HostServices::default();
        let manager = PluginManager::new(
            config,
            Arc::clone(&store),
            loader.clone(),
            services.clone(),
        )
        .await
        .unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        manager.events().on(plughost_plugins::EventFilter::All, move |event| {
            sink.lock().push((event.event_type, event.plugin_name.clone()));
            Ok(())
        });

        Self {
            dir,
            manager,
            store,
            loader,
            services,
            events,
        }
    }

    /// Register a probe-backed entry point for `name`
    pub fn register(&self, name: &str, behaviour: HookBehaviour) -> Arc<Probe> {
        let probe = Arc::new(Probe::default());
        let shared = probe.clone();
        self.loader.register(name, move || {
            Box::new(ProbePlugin::new(shared.clone(), behaviour))
        });
        probe
    }

    pub fn event_types(&self) -> Vec<PluginEventType> {
        self.events.lock().iter().map(|(t, _)| *t).collect()
    }
}
