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

//! In-process lifecycle event bus
//!
//! Delivery is synchronous and in registration order. A listener that returns
//! an error or panics is logged and skipped; the emitter and the remaining
//! listeners are unaffected.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{trace, warn};
use uuid::Uuid;

/// Lifecycle event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginEventType {
    Installed,
    Activated,
    Deactivated,
    Uninstalled,
    /// Plugin moved to the Error state
    Failed,
    /// Manually recorded operation
    Operation,
}

impl PluginEventType {
    pub const ALL: [PluginEventType; 6] = [
        PluginEventType::Installed,
        PluginEventType::Activated,
        PluginEventType::Deactivated,
        PluginEventType::Uninstalled,
        PluginEventType::Failed,
        PluginEventType::Operation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PluginEventType::Installed => "installed",
            PluginEventType::Activated => "activated",
            PluginEventType::Deactivated => "deactivated",
            PluginEventType::Uninstalled => "uninstalled",
            PluginEventType::Failed => "failed",
            PluginEventType::Operation => "operation",
        }
    }
}

impl fmt::Display for PluginEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PluginEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown event type '{}'", s))
    }
}

/// A lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginEvent {
    pub event_type: PluginEventType,
    pub plugin_id: Option<Uuid>,
    pub plugin_name: String,
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl PluginEvent {
    pub fn new(
        event_type: PluginEventType,
        plugin_id: Option<Uuid>,
        plugin_name: &str,
        tenant_id: &str,
    ) -> Self {
        Self {
            event_type,
            plugin_id,
            plugin_name: plugin_name.to_string(),
            tenant_id: tenant_id.to_string(),
            user_id: None,
            timestamp: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Which events a listener receives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    /// `'*'`
    All,
    Only(PluginEventType),
}

impl EventFilter {
    pub fn matches(&self, event_type: PluginEventType) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Only(t) => *t == event_type,
        }
    }
}

impl From<PluginEventType> for EventFilter {
    fn from(t: PluginEventType) -> Self {
        EventFilter::Only(t)
    }
}

impl FromStr for EventFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" {
            Ok(EventFilter::All)
        } else {
            s.parse().map(EventFilter::Only)
        }
    }
}

/// Event listener callback type
pub type EventListener = Arc<dyn Fn(&PluginEvent) -> anyhow::Result<()> + Send + Sync>;

/// Listener registration id
pub type SubscriptionId = u64;

struct Registration {
    id: SubscriptionId,
    filter: EventFilter,
    once: bool,
    listener: EventListener,
}

#[derive(Default)]
struct BusInner {
    listeners: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn remove(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|r| r.id != id);
        before != listeners.len()
    }
}

/// Handle returned by [`EventBus::on`]; dropping it keeps the listener registered
pub struct Subscription {
    id: SubscriptionId,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Remove the listener. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        self.bus.upgrade().map(|b| b.remove(self.id)).unwrap_or(false)
    }
}

/// Event bus, cheap to clone
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener
    pub fn on<F>(&self, filter: impl Into<EventFilter>, listener: F) -> Subscription
    where
        F: Fn(&PluginEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(filter.into(), false, Arc::new(listener))
    }

    /// Register a listener removed after its first delivery
    pub fn once<F>(&self, filter: impl Into<EventFilter>, listener: F) -> Subscription
    where
        F: Fn(&PluginEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(filter.into(), true, Arc::new(listener))
    }

    /// Remove a listener by id
    pub fn off(&self, id: SubscriptionId) -> bool {
        self.inner.remove(id)
    }

    fn register(&self, filter: EventFilter, once: bool, listener: EventListener) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push(Registration {
            id,
            filter,
            once,
            listener,
        });
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    /// Deliver an event to every matching listener
    pub fn emit(&self, event: &PluginEvent) {
        // Snapshot under the lock, call outside it so listeners may re-register
        let targets: Vec<(SubscriptionId, EventListener)> = {
            let mut listeners = self.inner.listeners.lock();
            let targets = listeners
                .iter()
                .filter(|r| r.filter.matches(event.event_type))
                .map(|r| (r.id, r.listener.clone()))
                .collect();
            listeners.retain(|r| !(r.once && r.filter.matches(event.event_type)));
            targets
        };

        trace!(event = %event.event_type, listeners = targets.len(), "Emitting plugin event");

        for (id, listener) in targets {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener(event)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(subscription = id, event = %event.event_type, error = %e, "Event listener failed");
                }
                Err(_) => {
                    warn!(subscription = id, event = %event.event_type, "Event listener panicked");
                }
            }
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}
