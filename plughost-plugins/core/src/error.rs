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

//! Plugin error types

use thiserror::Error;

/// Result type for plugin operations
pub type PluginResult<T> = Result<T, PluginError>;

/// Broad error category, used by callers to map failures onto responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad package or manifest; resubmit a corrected package
    Validation,
    /// Duplicate name or unsatisfiable dependencies
    Conflict,
    /// Unknown plugin id
    NotFound,
    /// Entry point missing or failed while loading
    RuntimeLoad,
    /// Plugin code touched something outside its declared permissions
    PermissionDenied,
    /// Host-side failure (I/O, serialization, store)
    Internal,
}

/// Errors that can occur in the plugin system
#[derive(Debug, Error)]
pub enum PluginError {
    // Manifest / package errors
    #[error("Manifest not found in archive: {0}")]
    ManifestNotFound(String),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Invalid archive: {0}")]
    InvalidArchive(String),

    #[error("Invalid tenant id: '{0}'")]
    InvalidTenant(String),

    #[error("Package validation failed: {}", .0.join("; "))]
    ValidationFailed(Vec<String>),

    // Conflict errors
    #[error("Plugin already installed: {0}")]
    AlreadyInstalled(String),

    #[error("Unsatisfied dependencies for '{plugin}': {details}")]
    DependencyConflict { plugin: String, details: String },

    #[error("Dependency cycle detected: {0}")]
    DependencyCycle(String),

    #[error("Plugin has dependents: {0:?}")]
    HasDependents(Vec<String>),

    // Lookup errors
    #[error("Plugin not found: {0}")]
    NotFound(String),

    // Runtime errors
    #[error("Plugin load failed: {0}")]
    LoadFailed(String),

    #[error("Plugin not loaded: {0}")]
    NotLoaded(String),

    #[error("Entry point not readable: {0}")]
    EntryPointMissing(String),

    #[error("Route not found: {method} {path}")]
    RouteNotFound { method: String, path: String },

    // Permission errors
    #[error("Permission denied for plugin '{plugin}': {resource}")]
    PermissionDenied { plugin: String, resource: String },

    // Host collaborators
    #[error("Store error: {0}")]
    Store(String),

    #[error("Host service error: {0}")]
    Host(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // IO errors
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl PluginError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            PluginError::ManifestNotFound(_)
            | PluginError::InvalidManifest(_)
            | PluginError::InvalidArchive(_)
            | PluginError::InvalidTenant(_)
            | PluginError::ValidationFailed(_) => ErrorKind::Validation,
            PluginError::AlreadyInstalled(_)
            | PluginError::DependencyConflict { .. }
            | PluginError::DependencyCycle(_)
            | PluginError::HasDependents(_) => ErrorKind::Conflict,
            PluginError::NotFound(_) | PluginError::RouteNotFound { .. } => ErrorKind::NotFound,
            PluginError::LoadFailed(_)
            | PluginError::NotLoaded(_)
            | PluginError::EntryPointMissing(_) => ErrorKind::RuntimeLoad,
            PluginError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            PluginError::Store(_)
            | PluginError::Host(_)
            | PluginError::Config(_)
            | PluginError::IoError(_)
            | PluginError::SerializationError(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn denied(plugin: &str, resource: impl Into<String>) -> Self {
        PluginError::PermissionDenied {
            plugin: plugin.to_string(),
            resource: resource.into(),
        }
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(e: serde_json::Error) -> Self {
        PluginError::SerializationError(e.to_string())
    }
}

impl From<zip::result::ZipError> for PluginError {
    fn from(e: zip::result::ZipError) -> Self {
        PluginError::InvalidArchive(e.to_string())
    }
}

impl From<toml::de::Error> for PluginError {
    fn from(e: toml::de::Error) -> Self {
        PluginError::Config(e.to_string())
    }
}

impl From<semver::Error> for PluginError {
    fn from(e: semver::Error) -> Self {
        PluginError::InvalidManifest(format!("Invalid version: {}", e))
    }
}

/// Failure of a best-effort lifecycle hook.
///
/// Never converted into a [`PluginError`]: the orchestrator logs it and moves on.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("Hook execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Hook timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Hook entry point could not be loaded: {0}")]
    LoadFailed(String),
}
