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

//! Declared plugin permissions
//!
//! A plugin declares up to four independent facets (`api`, `database`, `ui`,
//! `modules`). A missing facet denies every access of that kind; nothing is
//! granted implicitly. Endpoint and table names may contain `*` wildcards,
//! which are compiled once when the manifest is parsed.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// HTTP methods a plugin may declare
pub const KNOWN_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// A `*`-glob compiled to an anchored regular expression
#[derive(Clone)]
pub struct GlobPattern {
    source: String,
    regex: Regex,
}

impl GlobPattern {
    /// Compile a pattern. Each `*` matches any (possibly empty) run of characters.
    pub fn new(source: &str) -> Result<Self, String> {
        if source.trim().is_empty() {
            return Err("pattern cannot be empty".to_string());
        }
        if source.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(format!("pattern '{}' contains whitespace", source));
        }

        let body = source
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let regex = Regex::new(&format!("^{}$", body))
            .map_err(|e| format!("pattern '{}' is malformed: {}", source, e))?;

        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    /// Pattern text as declared
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether the pattern contains a wildcard
    pub fn is_wildcard(&self) -> bool {
        self.source.contains('*')
    }

    /// Test a candidate against the pattern
    pub fn matches(&self, candidate: &str) -> bool {
        self.regex.is_match(candidate)
    }
}

impl fmt::Debug for GlobPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GlobPattern").field(&self.source).finish()
    }
}

impl fmt::Display for GlobPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl PartialEq for GlobPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for GlobPattern {}

impl Serialize for GlobPattern {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for GlobPattern {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        GlobPattern::new(&raw).map_err(serde::de::Error::custom)
    }
}

/// Database operations a plugin can be granted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseOperation {
    Read,
    Write,
    Delete,
}

impl fmt::Display for DatabaseOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseOperation::Read => write!(f, "read"),
            DatabaseOperation::Write => write!(f, "write"),
            DatabaseOperation::Delete => write!(f, "delete"),
        }
    }
}

/// Module registry actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleAction {
    Create,
    Extend,
}

/// UI resource kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiResource {
    Component,
    Page,
}

/// `api` facet
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiPermission {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<Vec<GlobPattern>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<String>>,
}

/// `database` facet
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabasePermission {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tables: Option<Vec<GlobPattern>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operations: Option<Vec<DatabaseOperation>>,
}

/// `ui` facet
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiPermission {
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default)]
    pub pages: Vec<String>,
}

/// `modules` facet
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModulePermission {
    #[serde(default)]
    pub extend: Vec<String>,
    #[serde(default)]
    pub create: bool,
}

/// Full permission declaration of a plugin
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<ApiPermission>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabasePermission>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui: Option<UiPermission>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modules: Option<ModulePermission>,
}

impl PermissionSet {
    /// Structural validation beyond what serde enforces
    pub fn validate(&self) -> Result<(), String> {
        if let Some(methods) = self.api.as_ref().and_then(|a| a.methods.as_ref()) {
            for method in methods {
                if !KNOWN_METHODS.contains(&method.as_str()) {
                    return Err(format!("unknown HTTP method '{}'", method));
                }
            }
        }

        if let Some(modules) = &self.modules {
            if modules.extend.iter().any(|m| m.trim().is_empty()) {
                return Err("module names in 'modules.extend' cannot be empty".to_string());
            }
        }

        Ok(())
    }

    /// Upper-case declared methods so comparisons are case-insensitive
    pub(crate) fn normalize(&mut self) {
        if let Some(methods) = self.api.as_mut().and_then(|a| a.methods.as_mut()) {
            for method in methods.iter_mut() {
                *method = method.to_ascii_uppercase();
            }
        }
    }

    /// Number of declared API endpoints
    pub fn endpoint_count(&self) -> usize {
        self.api
            .as_ref()
            .and_then(|a| a.endpoints.as_ref())
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Number of declared database tables
    pub fn table_count(&self) -> usize {
        self.database
            .as_ref()
            .and_then(|d| d.tables.as_ref())
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Human-readable summary, one line per facet
    pub fn describe(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(api) = &self.api {
            let endpoints = api
                .endpoints
                .as_ref()
                .map(|e| join(e.iter().map(GlobPattern::as_str)))
                .unwrap_or_else(|| "any".to_string());
            let methods = api
                .methods
                .as_ref()
                .map(|m| join(m.iter().map(String::as_str)))
                .unwrap_or_else(|| "any".to_string());
            lines.push(format!("api: endpoints [{}], methods [{}]", endpoints, methods));
        }
        if let Some(db) = &self.database {
            let tables = db
                .tables
                .as_ref()
                .map(|t| join(t.iter().map(GlobPattern::as_str)))
                .unwrap_or_else(|| "any".to_string());
            let ops = db
                .operations
                .as_ref()
                .map(|o| o.iter().map(|op| op.to_string()).collect::<Vec<_>>().join(", "))
                .unwrap_or_else(|| "any".to_string());
            lines.push(format!("database: tables [{}], operations [{}]", tables, ops));
        }
        if let Some(ui) = &self.ui {
            lines.push(format!(
                "ui: components [{}], pages [{}]",
                ui.components.join(", "),
                ui.pages.join(", ")
            ));
        }
        if let Some(modules) = &self.modules {
            lines.push(format!(
                "modules: extend [{}], create {}",
                modules.extend.join(", "),
                modules.create
            ));
        }
        lines
    }
}

fn join<'a>(items: impl Iterator<Item = &'a str>) -> String {
    items.collect::<Vec<_>>().join(", ")
}
