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

//! Plugin host configuration

use crate::error::{PluginError, PluginResult};
use crate::validator::ValidationLimits;
use crate::{AUDIT_LOG_FILENAME, PLUGINS_DIR_NAME, STORE_FILENAME};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Plugin host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// Base directory for plugin data
    pub data_dir: PathBuf,
    /// Host version checked against `dependencies.system`
    pub system_version: String,
    /// Upper bound for a single lifecycle hook
    pub hook_timeout_ms: u64,
    /// Package validation limits
    pub limits: ValidationLimits,
    /// Audit log location; defaults to `<data_dir>/audit.jsonl`
    pub audit_log_file: Option<PathBuf>,
}

impl Default for PluginConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("plughost");

        Self {
            data_dir,
            system_version: env!("CARGO_PKG_VERSION").to_string(),
            hook_timeout_ms: 30_000,
            limits: ValidationLimits::default(),
            audit_log_file: None,
        }
    }
}

impl PluginConfig {
    /// Defaults rooted at `data_dir`
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Defaults overridden by `PLUGHOST_*` environment variables
    pub fn from_env() -> PluginResult<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load a TOML file; missing keys fall back to defaults
    pub fn from_toml_file(path: &Path) -> PluginResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| PluginError::Config(format!("{}: {}", path.display(), e)))?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> PluginResult<()> {
        if let Some(dir) = var("PLUGHOST_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(timeout) = var("PLUGHOST_HOOK_TIMEOUT_MS") {
            self.hook_timeout_ms = timeout.trim().parse().map_err(|_| {
                PluginError::Config(format!("PLUGHOST_HOOK_TIMEOUT_MS is not a number: {timeout}"))
            })?;
        }
        if let Some(version) = var("PLUGHOST_SYSTEM_VERSION") {
            self.system_version = version.trim().to_string();
        }
        if let Some(file) = var("PLUGHOST_AUDIT_LOG") {
            self.audit_log_file = Some(PathBuf::from(file));
        }
        self.validate()
    }

    pub fn validate(&self) -> PluginResult<()> {
        semver::Version::parse(&self.system_version).map_err(|e| {
            PluginError::Config(format!("system_version '{}': {}", self.system_version, e))
        })?;
        if self.hook_timeout_ms == 0 {
            return Err(PluginError::Config("hook_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn system_version(&self) -> PluginResult<semver::Version> {
        Ok(semver::Version::parse(&self.system_version)?)
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_millis(self.hook_timeout_ms)
    }

    /// Root of extracted plugin trees
    pub fn plugins_dir(&self) -> PathBuf {
        self.data_dir.join(PLUGINS_DIR_NAME)
    }

    /// File backing [`JsonFilePluginStore`](crate::store::JsonFilePluginStore)
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(STORE_FILENAME)
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.audit_log_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join(AUDIT_LOG_FILENAME))
    }
}
