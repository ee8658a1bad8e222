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

//! Plugin entry-point contract
//!
//! Every plugin backend implements [`PluginEntryPoint`]. Native plugins expose
//! it through a single exported constructor, see [`export_plugin!`].
//!
//! [`export_plugin!`]: crate::export_plugin

use crate::context::PluginContext;
use crate::manifest::LifecycleHook;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Name of the constructor symbol a native plugin library must export
pub const ENTRY_SYMBOL: &[u8] = b"plughost_plugin_create\0";

/// Name of the ABI version symbol a native plugin library must export
pub const ABI_VERSION_SYMBOL: &[u8] = b"plughost_abi_version\0";

/// Bumped whenever [`PluginEntryPoint`] changes shape
pub const ABI_VERSION: u32 = 1;

/// The code side of a plugin.
///
/// All methods have no-op defaults. Instances are shared behind an `Arc`, so
/// implementations use interior mutability for state they keep.
#[async_trait]
pub trait PluginEntryPoint: Send + Sync {
    /// Called once after loading, before any route is served
    async fn initialize(&self, _context: Arc<PluginContext>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once when the runtime is unloaded
    async fn cleanup(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Route handlers provided by the plugin
    fn api_handlers(&self) -> Vec<RouteHandler> {
        Vec::new()
    }

    async fn on_install(&self, _context: Arc<PluginContext>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_activate(&self, _context: Arc<PluginContext>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_deactivate(&self, _context: Arc<PluginContext>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_uninstall(&self, _context: Arc<PluginContext>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Dispatch a lifecycle hook to the matching trait method
pub async fn invoke_hook(
    instance: &dyn PluginEntryPoint,
    hook: LifecycleHook,
    context: Arc<PluginContext>,
) -> anyhow::Result<()> {
    match hook {
        LifecycleHook::OnInstall => instance.on_install(context).await,
        LifecycleHook::OnActivate => instance.on_activate(context).await,
        LifecycleHook::OnDeactivate => instance.on_deactivate(context).await,
        LifecycleHook::OnUninstall => instance.on_uninstall(context).await,
    }
}

/// Request routed to a plugin handler
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
    #[serde(default)]
    pub query: HashMap<String, String>,
    #[serde(default)]
    pub body: serde_json::Value,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl ApiRequest {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
            ..Default::default()
        }
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = body;
        self
    }
}

/// Handler response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl ApiResponse {
    pub fn ok(body: serde_json::Value) -> Self {
        Self { status: 200, body }
    }

    pub fn with_status(status: u16, body: serde_json::Value) -> Self {
        Self { status, body }
    }

    pub fn not_implemented(method: &str, path: &str) -> Self {
        Self {
            status: 501,
            body: serde_json::json!({
                "error": "Not implemented",
                "route": format!("{} {}", method, path),
            }),
        }
    }
}

/// A single API route handler
#[async_trait]
pub trait ApiHandler: Send + Sync {
    async fn handle(&self, request: ApiRequest) -> anyhow::Result<ApiResponse>;
}

/// Adapter turning an async closure into an [`ApiHandler`]
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ApiHandler for FnHandler<F>
where
    F: Fn(ApiRequest) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<ApiResponse>> + Send,
{
    async fn handle(&self, request: ApiRequest) -> anyhow::Result<ApiResponse> {
        (self.0)(request).await
    }
}

/// Handler bound to a method and path
#[derive(Clone)]
pub struct RouteHandler {
    pub method: String,
    pub path: String,
    pub handler: Arc<dyn ApiHandler>,
}

impl RouteHandler {
    pub fn new(method: &str, path: &str, handler: Arc<dyn ApiHandler>) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
            handler,
        }
    }

    /// Build a route from an async closure
    pub fn from_fn<F, Fut>(method: &str, path: &str, f: F) -> Self
    where
        F: Fn(ApiRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ApiResponse>> + Send + 'static,
    {
        Self::new(method, path, Arc::new(FnHandler(f)))
    }
}

impl std::fmt::Debug for RouteHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteHandler")
            .field("method", &self.method)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Export a plugin type from a `cdylib`.
///
/// ```ignore
/// plughost_plugins::export_plugin!(MyPlugin::default());
/// ```
#[macro_export]
macro_rules! export_plugin {
    ($ctor:expr) => {
        #[no_mangle]
        pub extern "C" fn plughost_abi_version() -> u32 {
            $crate::entry::ABI_VERSION
        }

        #[no_mangle]
        pub extern "C" fn plughost_plugin_create() -> *mut ::std::boxed::Box<dyn $crate::entry::PluginEntryPoint> {
            let instance: ::std::boxed::Box<dyn $crate::entry::PluginEntryPoint> =
                ::std::boxed::Box::new($ctor);
            ::std::boxed::Box::into_raw(::std::boxed::Box::new(instance))
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        installs: AtomicUsize,
    }

    #[async_trait]
    impl PluginEntryPoint for Counter {
        async fn on_install(&self, _context: Arc<PluginContext>) -> anyhow::Result<()> {
            self.installs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn api_handlers(&self) -> Vec<RouteHandler> {
            vec![RouteHandler::from_fn("get", "/ping", |_req| async {
                Ok(ApiResponse::ok(serde_json::json!("pong")))
            })]
        }
    }

    #[tokio::test]
    async fn test_hook_dispatch_and_handlers() {
        let counter = Counter::default();
        let context = Arc::new(PluginContext::detached("counter", "1.0.0"));

        invoke_hook(&counter, LifecycleHook::OnInstall, context.clone())
            .await
            .unwrap();
        invoke_hook(&counter, LifecycleHook::OnDeactivate, context)
            .await
            .unwrap();
        assert_eq!(counter.installs.load(Ordering::SeqCst), 1);

        let handlers = counter.api_handlers();
        assert_eq!(handlers[0].method, "GET");
        let response = handlers[0]
            .handler
            .handle(ApiRequest::new("GET", "/ping"))
            .await
            .unwrap();
        assert_eq!(response.body, serde_json::json!("pong"));
    }

    #[test]
    fn test_not_implemented_response() {
        let response = ApiResponse::not_implemented("POST", "/sync");
        assert_eq!(response.status, 501);
    }
}
