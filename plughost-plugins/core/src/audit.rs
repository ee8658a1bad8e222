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

//! Append-only audit log
//!
//! One JSON object per line. Records are written once and never rewritten.
//! Appends go to an in-memory buffer so event delivery never waits on the
//! disk; [`AuditLogger::flush`] and every query push them to the file.

use crate::error::PluginResult;
use crate::events::{EventBus, EventFilter, PluginEvent, PluginEventType, Subscription};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// A single audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub event_type: PluginEventType,
    pub plugin_id: Option<Uuid>,
    pub plugin_name: String,
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub action: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl AuditEntry {
    /// Record for an operation not covered by lifecycle events
    pub fn operation(action: &str, plugin_name: &str, tenant_id: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: PluginEventType::Operation,
            plugin_id: None,
            plugin_name: plugin_name.to_string(),
            tenant_id: tenant_id.to_string(),
            user_id: None,
            action: action.to_string(),
            success: true,
            error: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_plugin_id(mut self, plugin_id: Uuid) -> Self {
        self.plugin_id = Some(plugin_id);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

impl From<&PluginEvent> for AuditEntry {
    fn from(event: &PluginEvent) -> Self {
        let error = event
            .metadata
            .get("error")
            .and_then(|e| e.as_str())
            .map(str::to_string);
        Self {
            timestamp: event.timestamp,
            event_type: event.event_type,
            plugin_id: event.plugin_id,
            plugin_name: event.plugin_name.clone(),
            tenant_id: event.tenant_id.clone(),
            user_id: event.user_id.clone(),
            action: format!("plugin.{}", event.event_type),
            success: event.event_type != PluginEventType::Failed && error.is_none(),
            error,
            metadata: event.metadata.clone(),
        }
    }
}

/// Filters for [`AuditLogger::query_logs`]; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub plugin_id: Option<Uuid>,
    pub tenant_id: Option<String>,
    pub event_type: Option<PluginEventType>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Keep only the most recent N matches
    pub limit: Option<usize>,
}

impl AuditQuery {
    fn matches(&self, entry: &AuditEntry) -> bool {
        if self.plugin_id.is_some() && entry.plugin_id != self.plugin_id {
            return false;
        }
        if let Some(tenant) = &self.tenant_id {
            if &entry.tenant_id != tenant {
                return false;
            }
        }
        if let Some(event_type) = self.event_type {
            if entry.event_type != event_type {
                return false;
            }
        }
        if let Some(from) = self.from {
            if entry.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if entry.timestamp > to {
                return false;
            }
        }
        true
    }
}

/// JSONL audit logger
pub struct AuditLogger {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl AuditLogger {
    /// Open (or create) the log file for appending
    pub fn open(path: impl Into<PathBuf>) -> PluginResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(path = %path.display(), "Opened audit log");
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Subscribe to every event on the bus
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> Subscription {
        let logger = Arc::clone(self);
        bus.on(EventFilter::All, move |event| {
            logger.append(&AuditEntry::from(event))?;
            Ok(())
        })
    }

    /// Record an operation directly
    pub fn log_operation(&self, entry: AuditEntry) -> PluginResult<()> {
        self.append(&entry)
    }

    /// Write buffered records through to disk
    pub fn flush(&self) -> PluginResult<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }

    fn append(&self, entry: &AuditEntry) -> PluginResult<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        // One write per record keeps lines whole when the buffer spills
        self.writer.lock().write_all(&line)?;
        Ok(())
    }

    /// Read back entries matching the query, oldest first
    pub fn query_logs(&self, query: &AuditQuery) -> PluginResult<Vec<AuditEntry>> {
        self.writer.lock().flush()?;
        let reader = BufReader::new(File::open(&self.path)?);
        let mut entries = Vec::new();

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEntry>(&line) {
                Ok(entry) if query.matches(&entry) => entries.push(entry),
                Ok(_) => {}
                Err(e) => warn!(line = index + 1, error = %e, "Skipping malformed audit record"),
            }
        }

        if let Some(limit) = query.limit {
            if entries.len() > limit {
                entries.drain(..entries.len() - limit);
            }
        }

        Ok(entries)
    }
}

impl Drop for AuditLogger {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(path = %self.path.display(), error = %e, "Failed to flush audit log");
        }
    }
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger").field("path", &self.path).finish()
    }
}
