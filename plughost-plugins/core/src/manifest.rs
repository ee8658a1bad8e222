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

//! Plugin manifest schema and parser
//!
//! Defines the structure of the `manifest.json` file at the root of every
//! plugin archive. Parsing is pure: no I/O, no side effects. Semantic limits on
//! permissions (too many tables, wildcards) are the validator's concern, not
//! the parser's.

use crate::error::{PluginError, PluginResult};
use crate::permissions::{PermissionSet, KNOWN_METHODS};
use once_cell::sync::Lazy;
use regex::Regex;
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Component, Path};

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9._-]{0,127}$").expect("valid regex"));

static VERSION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d+\.\d+\.\d+(-[0-9A-Za-z-]+(\.[0-9A-Za-z-]+)*)?$").expect("valid regex")
});

/// Plugin manifest - the declarative description of a plugin package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    /// Unique (per tenant) plugin name
    pub name: String,

    /// Plugin version (`MAJOR.MINOR.PATCH[-prerelease]`)
    pub version: String,

    /// Plugin type
    #[serde(rename = "type")]
    pub plugin_type: PluginType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,

    /// Declared capabilities
    #[serde(default)]
    pub permissions: PermissionSet,

    /// Plugin and host-system dependencies
    #[serde(default)]
    pub dependencies: Dependencies,

    /// Code entry points
    pub entry: EntryPoints,

    /// Lifecycle hooks exported by the backend entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<HookDeclarations>,

    /// Declared API routes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<ApiDeclarations>,

    /// UI declarations, passed through to the host front-end untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui: Option<serde_json::Value>,

    /// Plugin configuration blob, exposed through the context metadata facet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

/// Plugin type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    /// Backend integration with API routes and data access
    Integration,
    /// UI extension (components, pages)
    Ui,
    /// Visual theme
    Theme,
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginType::Integration => write!(f, "integration"),
            PluginType::Ui => write!(f, "ui"),
            PluginType::Theme => write!(f, "theme"),
        }
    }
}

/// Entry points for the plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoints {
    /// Backend code entry, relative to the archive root
    pub backend: String,
    /// Optional front-end bundle, relative to the archive root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frontend: Option<String>,
}

/// Lifecycle hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleHook {
    #[serde(rename = "onInstall")]
    OnInstall,
    #[serde(rename = "onActivate")]
    OnActivate,
    #[serde(rename = "onDeactivate")]
    OnDeactivate,
    #[serde(rename = "onUninstall")]
    OnUninstall,
}

impl LifecycleHook {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleHook::OnInstall => "onInstall",
            LifecycleHook::OnActivate => "onActivate",
            LifecycleHook::OnDeactivate => "onDeactivate",
            LifecycleHook::OnUninstall => "onUninstall",
        }
    }
}

impl fmt::Display for LifecycleHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hook name -> export name declared by the plugin
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookDeclarations {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_install: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_activate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_deactivate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_uninstall: Option<String>,
}

impl HookDeclarations {
    /// Export name for a hook, if declared
    pub fn declared(&self, hook: LifecycleHook) -> Option<&str> {
        match hook {
            LifecycleHook::OnInstall => self.on_install.as_deref(),
            LifecycleHook::OnActivate => self.on_activate.as_deref(),
            LifecycleHook::OnDeactivate => self.on_deactivate.as_deref(),
            LifecycleHook::OnUninstall => self.on_uninstall.as_deref(),
        }
    }
}

/// Declared API surface
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiDeclarations {
    #[serde(default)]
    pub routes: Vec<RouteDeclaration>,
}

/// A single declared route
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteDeclaration {
    pub path: String,
    pub method: String,
    pub handler: String,
}

/// Declared dependencies
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependencies {
    /// Other plugins that must be installed first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugins: Vec<PluginDependency>,
    /// Host-system requirement; a bare version means "at least this version"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemRequirement>,
}

/// A dependency on another plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDependency {
    pub name: String,
    pub version: VersionRange,
}

/// npm-style version range (`^1.0.0`, `>=1.2 <2`, `1.x || 2.x`, `*`)
#[derive(Clone)]
pub struct VersionRange {
    source: String,
    alternatives: Vec<VersionReq>,
}

impl VersionRange {
    /// Parse a range. A bare full version means exactly that version.
    pub fn parse(source: &str) -> Result<Self, String> {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return Err("version range cannot be empty".to_string());
        }

        let mut alternatives = Vec::new();
        for alternative in trimmed.split("||") {
            let alternative = alternative.trim();
            let req = if alternative.is_empty()
                || alternative == "*"
                || alternative.eq_ignore_ascii_case("x")
                || alternative == "latest"
            {
                VersionReq::STAR
            } else {
                let normalized = normalize_comparators(alternative)?;
                VersionReq::parse(&normalized)
                    .map_err(|e| format!("invalid version range '{}': {}", source, e))?
            };
            alternatives.push(req);
        }

        Ok(Self {
            source: trimmed.to_string(),
            alternatives,
        })
    }

    /// Range text as declared
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether `version` satisfies any alternative
    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|req| req.matches(version))
    }
}

/// Rewrite npm comparator syntax into what `semver::VersionReq` accepts
fn normalize_comparators(range: &str) -> Result<String, String> {
    let tokens: Vec<&str> = range
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .collect();

    // Hyphen range: "1.0.0 - 2.0.0"
    if tokens.len() == 3 && tokens[1] == "-" {
        return Ok(format!(">={}, <={}", tokens[0], tokens[2]));
    }

    let mut comparators = Vec::new();
    let mut pending_op: Option<&str> = None;
    for token in tokens {
        if token.chars().all(|c| matches!(c, '>' | '<' | '=' | '^' | '~')) {
            if pending_op.is_some() {
                return Err(format!("dangling operator in range '{}'", range));
            }
            pending_op = Some(token);
            continue;
        }

        let comparator = match pending_op.take() {
            Some(op) => format!("{}{}", op, token),
            None if is_exact_version(token) => format!("={}", token),
            None => token.to_string(),
        };
        comparators.push(comparator);
    }

    if pending_op.is_some() {
        return Err(format!("dangling operator in range '{}'", range));
    }

    Ok(comparators.join(", "))
}

fn is_exact_version(token: &str) -> bool {
    token.starts_with(|c: char| c.is_ascii_digit()) && Version::parse(token).is_ok()
}

impl fmt::Debug for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("VersionRange").field(&self.source).finish()
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl PartialEq for VersionRange {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for VersionRange {}

impl Serialize for VersionRange {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for VersionRange {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        VersionRange::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Minimum host-system version (or an explicit range)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemRequirement {
    range: VersionRange,
}

impl SystemRequirement {
    pub fn parse(source: &str) -> Result<Self, String> {
        let trimmed = source.trim();
        let range = match Version::parse(trimmed) {
            Ok(_) => {
                let mut range = VersionRange::parse(&format!(">={}", trimmed))?;
                range.source = trimmed.to_string();
                range
            }
            Err(_) => VersionRange::parse(trimmed)?,
        };
        Ok(Self { range })
    }

    pub fn as_str(&self) -> &str {
        self.range.as_str()
    }

    pub fn is_satisfied_by(&self, version: &Version) -> bool {
        self.range.matches(version)
    }
}

impl Serialize for SystemRequirement {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.range.as_str())
    }
}

impl<'de> Deserialize<'de> for SystemRequirement {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        SystemRequirement::parse(&raw).map_err(serde::de::Error::custom)
    }
}

impl PluginManifest {
    /// Parse and validate manifest bytes
    pub fn parse(bytes: &[u8]) -> PluginResult<Self> {
        let mut manifest: PluginManifest = serde_json::from_slice(bytes)
            .map_err(|e| PluginError::InvalidManifest(e.to_string()))?;
        manifest.permissions.normalize();
        manifest.validate()?;
        Ok(manifest)
    }

    /// Load and validate a manifest file from disk
    pub fn from_file(path: &Path) -> PluginResult<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| PluginError::ManifestNotFound(format!("{}: {}", path.display(), e)))?;
        Self::parse(&bytes)
    }

    /// Serialize back to manifest JSON
    pub fn to_json(&self) -> PluginResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Validate the manifest
    pub fn validate(&self) -> PluginResult<()> {
        if !NAME_RE.is_match(&self.name) {
            return Err(PluginError::InvalidManifest(format!(
                "Plugin name '{}' must be lowercase alphanumeric with '.', '-' or '_'",
                self.name
            )));
        }

        if !VERSION_RE.is_match(&self.version) {
            return Err(PluginError::InvalidManifest(format!(
                "Version '{}' must match MAJOR.MINOR.PATCH[-prerelease]",
                self.version
            )));
        }
        Version::parse(&self.version)?;

        validate_relative_path("entry.backend", &self.entry.backend)?;
        if let Some(frontend) = &self.entry.frontend {
            validate_relative_path("entry.frontend", frontend)?;
        }

        self.permissions
            .validate()
            .map_err(|e| PluginError::InvalidManifest(format!("permissions: {}", e)))?;

        let mut seen = HashSet::new();
        for dep in &self.dependencies.plugins {
            if dep.name.trim().is_empty() {
                return Err(PluginError::InvalidManifest(
                    "Dependency name cannot be empty".into(),
                ));
            }
            if dep.name == self.name {
                return Err(PluginError::InvalidManifest(format!(
                    "Plugin '{}' cannot depend on itself",
                    self.name
                )));
            }
            if !seen.insert(dep.name.as_str()) {
                return Err(PluginError::InvalidManifest(format!(
                    "Duplicate dependency '{}'",
                    dep.name
                )));
            }
        }

        if let Some(api) = &self.api {
            for route in &api.routes {
                if !route.path.starts_with('/') {
                    return Err(PluginError::InvalidManifest(format!(
                        "Route path '{}' must start with '/'",
                        route.path
                    )));
                }
                if !KNOWN_METHODS.contains(&route.method.to_ascii_uppercase().as_str()) {
                    return Err(PluginError::InvalidManifest(format!(
                        "Route '{}' has unknown method '{}'",
                        route.path, route.method
                    )));
                }
                if route.handler.trim().is_empty() {
                    return Err(PluginError::InvalidManifest(format!(
                        "Route '{} {}' has no handler",
                        route.method, route.path
                    )));
                }
            }
        }

        Ok(())
    }

    /// Parsed plugin version
    pub fn semver(&self) -> PluginResult<Version> {
        Ok(Version::parse(&self.version)?)
    }

    /// Export name declared for a hook
    pub fn hook_export(&self, hook: LifecycleHook) -> Option<&str> {
        self.hooks.as_ref().and_then(|h| h.declared(hook))
    }

    /// Declared routes (empty when the manifest has no `api` block)
    pub fn routes(&self) -> &[RouteDeclaration] {
        self.api.as_ref().map(|a| a.routes.as_slice()).unwrap_or(&[])
    }

    /// Compute content hash for integrity verification
    pub fn content_hash(&self) -> String {
        let content = serde_json::to_vec(self).unwrap_or_default();
        let hash = blake3::hash(&content);
        hex::encode(hash.as_bytes())
    }
}

fn validate_relative_path(field: &str, value: &str) -> PluginResult<()> {
    if value.trim().is_empty() {
        return Err(PluginError::InvalidManifest(format!("{} cannot be empty", field)));
    }
    let path = Path::new(value);
    let escapes = path.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes {
        return Err(PluginError::InvalidManifest(format!(
            "{} must be a relative path inside the package: {}",
            field, value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::DatabaseOperation;

    const SAMPLE_MANIFEST: &str = r#"{
        "name": "crm-sync",
        "version": "1.2.0-beta.1",
        "type": "integration",
        "description": "Syncs contacts",
        "author": "Acme",
        "permissions": {
            "api": { "endpoints": ["/api/contacts", "/api/contacts/*"], "methods": ["get", "POST"] },
            "database": { "tables": ["contacts"], "operations": ["read", "write"] },
            "modules": { "extend": ["contacts"], "create": true }
        },
        "dependencies": {
            "plugins": [{ "name": "core-auth", "version": "^1.0.0" }],
            "system": "1.0.0"
        },
        "entry": { "backend": "dist/index.js", "frontend": "dist/ui.js" },
        "hooks": { "onInstall": "onInstall", "onActivate": "start" },
        "api": { "routes": [{ "path": "/contacts", "method": "GET", "handler": "listContacts" }] },
        "config": { "batchSize": 50 }
    }"#;

    #[test]
    fn test_parse_manifest() {
        let manifest = PluginManifest::parse(SAMPLE_MANIFEST.as_bytes()).unwrap();
        assert_eq!(manifest.name, "crm-sync");
        assert_eq!(manifest.plugin_type, PluginType::Integration);
        assert_eq!(manifest.entry.backend, "dist/index.js");
        assert_eq!(manifest.hook_export(LifecycleHook::OnActivate), Some("start"));
        assert_eq!(manifest.hook_export(LifecycleHook::OnUninstall), None);
        assert_eq!(manifest.routes().len(), 1);

        let api = manifest.permissions.api.as_ref().unwrap();
        assert_eq!(api.methods.as_ref().unwrap(), &vec!["GET".to_string(), "POST".to_string()]);
        let db = manifest.permissions.database.as_ref().unwrap();
        assert_eq!(
            db.operations.as_ref().unwrap(),
            &vec![DatabaseOperation::Read, DatabaseOperation::Write]
        );
    }

    #[test]
    fn test_round_trip() {
        let manifest = PluginManifest::parse(SAMPLE_MANIFEST.as_bytes()).unwrap();
        let bytes = manifest.to_json().unwrap();
        let reparsed = PluginManifest::parse(&bytes).unwrap();
        assert_eq!(manifest, reparsed);
    }

    #[test]
    fn test_missing_backend_rejected() {
        let raw = r#"{ "name": "x", "version": "1.0.0", "type": "ui", "entry": {} }"#;
        let err = PluginManifest::parse(raw.as_bytes()).unwrap_err();
        assert!(matches!(err, PluginError::InvalidManifest(_)));
        assert!(err.to_string().contains("backend"));

        let raw = r#"{ "name": "x", "version": "1.0.0", "type": "ui" }"#;
        assert!(PluginManifest::parse(raw.as_bytes()).is_err());
    }

    #[test]
    fn test_invalid_version_and_type() {
        let bad_version = r#"{ "name": "x", "version": "1.0", "type": "ui", "entry": { "backend": "a.js" } }"#;
        assert!(PluginManifest::parse(bad_version.as_bytes()).is_err());

        let build_meta = r#"{ "name": "x", "version": "1.0.0+build", "type": "ui", "entry": { "backend": "a.js" } }"#;
        assert!(PluginManifest::parse(build_meta.as_bytes()).is_err());

        let bad_type = r#"{ "name": "x", "version": "1.0.0", "type": "widget", "entry": { "backend": "a.js" } }"#;
        assert!(PluginManifest::parse(bad_type.as_bytes()).is_err());
    }

    #[test]
    fn test_entry_path_traversal_rejected() {
        let raw = r#"{ "name": "x", "version": "1.0.0", "type": "ui", "entry": { "backend": "../evil.js" } }"#;
        let err = PluginManifest::parse(raw.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("entry.backend"));
    }

    #[test]
    fn test_malformed_glob_rejected_at_parse() {
        let raw = r#"{ "name": "x", "version": "1.0.0", "type": "ui", "entry": { "backend": "a.js" },
            "permissions": { "api": { "endpoints": [""] } } }"#;
        assert!(PluginManifest::parse(raw.as_bytes()).is_err());
    }

    #[test]
    fn test_version_ranges() {
        let v = |s: &str| Version::parse(s).unwrap();

        let caret = VersionRange::parse("^1.0.0").unwrap();
        assert!(caret.matches(&v("1.5.0")));
        assert!(!caret.matches(&v("2.0.0")));

        let exact = VersionRange::parse("1.2.3").unwrap();
        assert!(exact.matches(&v("1.2.3")));
        assert!(!exact.matches(&v("1.2.4")));

        let spaced = VersionRange::parse(">= 1.2.0 < 2.0.0").unwrap();
        assert!(spaced.matches(&v("1.9.9")));
        assert!(!spaced.matches(&v("2.0.0")));

        let hyphen = VersionRange::parse("1.0.0 - 1.4.0").unwrap();
        assert!(hyphen.matches(&v("1.4.0")));
        assert!(!hyphen.matches(&v("1.4.1")));

        let either = VersionRange::parse("^1.0.0 || ^3.0.0").unwrap();
        assert!(either.matches(&v("3.1.0")));
        assert!(!either.matches(&v("2.1.0")));

        assert!(VersionRange::parse("*").unwrap().matches(&v("9.9.9")));
        assert!(VersionRange::parse(">=").is_err());
    }

    #[test]
    fn test_system_requirement_bare_version_is_minimum() {
        let req = SystemRequirement::parse("1.4.0").unwrap();
        assert!(req.is_satisfied_by(&Version::parse("1.4.0").unwrap()));
        assert!(req.is_satisfied_by(&Version::parse("2.0.0").unwrap()));
        assert!(!req.is_satisfied_by(&Version::parse("1.3.9").unwrap()));
        assert_eq!(req.as_str(), "1.4.0");
    }

    #[test]
    fn test_self_dependency_rejected() {
        let raw = r#"{ "name": "x", "version": "1.0.0", "type": "ui", "entry": { "backend": "a.js" },
            "dependencies": { "plugins": [{ "name": "x", "version": "*" }] } }"#;
        assert!(PluginManifest::parse(raw.as_bytes()).is_err());
    }
}
