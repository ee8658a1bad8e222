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

//! Dependency resolver
//!
//! Checks a candidate manifest against the plugins already installed for a
//! tenant: missing dependencies, version-range mismatches, the host-system
//! requirement and dependency cycles. Also provides reverse-dependency lookup
//! and a Kahn's-algorithm load order used when restoring active plugins.

use crate::error::{PluginError, PluginResult};
use crate::manifest::PluginManifest;
use semver::Version;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};

/// Name used for the host-system entry in `incompatible`
pub const SYSTEM_DEPENDENCY: &str = "system";

/// A plugin already installed for the tenant, as seen by the resolver
#[derive(Debug, Clone)]
pub struct InstalledPlugin {
    pub name: String,
    pub version: Version,
    /// Names of the plugins this one depends on
    pub dependencies: Vec<String>,
}

impl InstalledPlugin {
    pub fn new(name: &str, version: &str, dependencies: Vec<String>) -> PluginResult<Self> {
        Ok(Self {
            name: name.to_string(),
            version: Version::parse(version)?,
            dependencies,
        })
    }

    pub fn from_manifest(manifest: &PluginManifest) -> PluginResult<Self> {
        Ok(Self {
            name: manifest.name.clone(),
            version: manifest.semver()?,
            dependencies: manifest
                .dependencies
                .plugins
                .iter()
                .map(|d| d.name.clone())
                .collect(),
        })
    }
}

/// Outcome of checking one declared dependency
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyCheck {
    pub name: String,
    pub required_version_range: String,
    pub installed: bool,
    pub installed_version: Option<String>,
    pub compatible: bool,
}

impl DependencyCheck {
    fn describe(&self) -> String {
        match &self.installed_version {
            Some(v) => format!(
                "{} requires {} but {} is installed",
                self.name, self.required_version_range, v
            ),
            None => format!("{} {} is not installed", self.name, self.required_version_range),
        }
    }
}

/// Result of resolving a manifest's dependencies
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub can_install: bool,
    pub checks: Vec<DependencyCheck>,
    pub missing: Vec<DependencyCheck>,
    pub incompatible: Vec<DependencyCheck>,
    pub circular: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle_path: Option<Vec<String>>,
}

impl Resolution {
    /// Turn a failed resolution into the matching conflict error
    pub fn into_result(self, plugin: &str) -> PluginResult<Self> {
        if let Some(path) = &self.cycle_path {
            return Err(PluginError::DependencyCycle(path.join(" -> ")));
        }
        if !self.can_install {
            let details = self
                .missing
                .iter()
                .chain(self.incompatible.iter())
                .map(DependencyCheck::describe)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(PluginError::DependencyConflict {
                plugin: plugin.to_string(),
                details,
            });
        }
        Ok(self)
    }
}

/// Dependency resolver
pub struct DependencyResolver {
    /// Running host version, checked against `dependencies.system`
    system_version: Version,
}

impl DependencyResolver {
    /// Create a new resolver
    pub fn new(system_version: Version) -> Self {
        Self { system_version }
    }

    pub fn system_version(&self) -> &Version {
        &self.system_version
    }

    /// Resolve a candidate manifest against the installed set
    pub fn resolve(&self, manifest: &PluginManifest, installed: &[InstalledPlugin]) -> Resolution {
        let by_name: HashMap<&str, &InstalledPlugin> =
            installed.iter().map(|p| (p.name.as_str(), p)).collect();

        let mut resolution = Resolution::default();

        for dep in &manifest.dependencies.plugins {
            let check = match by_name.get(dep.name.as_str()) {
                None => DependencyCheck {
                    name: dep.name.clone(),
                    required_version_range: dep.version.to_string(),
                    installed: false,
                    installed_version: None,
                    compatible: false,
                },
                Some(found) => DependencyCheck {
                    name: dep.name.clone(),
                    required_version_range: dep.version.to_string(),
                    installed: true,
                    installed_version: Some(found.version.to_string()),
                    compatible: dep.version.matches(&found.version),
                },
            };

            if !check.installed {
                resolution.missing.push(check.clone());
            } else if !check.compatible {
                resolution.incompatible.push(check.clone());
            }
            resolution.checks.push(check);
        }

        if let Some(system) = &manifest.dependencies.system {
            let compatible = system.is_satisfied_by(&self.system_version);
            let check = DependencyCheck {
                name: SYSTEM_DEPENDENCY.to_string(),
                required_version_range: system.as_str().to_string(),
                installed: true,
                installed_version: Some(self.system_version.to_string()),
                compatible,
            };
            if !compatible {
                resolution.incompatible.push(check.clone());
            }
            resolution.checks.push(check);
        }

        // Candidate's own edges take precedence over any stale installed record
        let mut graph: HashMap<&str, Vec<&str>> = installed
            .iter()
            .map(|p| {
                (
                    p.name.as_str(),
                    p.dependencies.iter().map(String::as_str).collect(),
                )
            })
            .collect();
        graph.insert(
            manifest.name.as_str(),
            manifest
                .dependencies
                .plugins
                .iter()
                .map(|d| d.name.as_str())
                .collect(),
        );

        resolution.cycle_path = detect_cycle(&graph, manifest.name.as_str());
        resolution.circular = resolution.cycle_path.is_some();
        resolution.can_install = resolution.missing.is_empty()
            && resolution.incompatible.is_empty()
            && !resolution.circular;

        resolution
    }

    /// Installed plugins that declare a dependency on `name`
    pub fn dependents_of(&self, name: &str, installed: &[InstalledPlugin]) -> Vec<String> {
        let mut dependents: Vec<String> = installed
            .iter()
            .filter(|p| p.name != name && p.dependencies.iter().any(|d| d == name))
            .map(|p| p.name.clone())
            .collect();
        dependents.sort();
        dependents
    }

    /// Order plugins so dependencies come first (Kahn's algorithm).
    ///
    /// Dependencies outside the given set are ignored.
    pub fn load_order(&self, plugins: &[InstalledPlugin]) -> PluginResult<Vec<String>> {
        let names: HashSet<&str> = plugins.iter().map(|p| p.name.as_str()).collect();
        let mut graph: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut in_degree: HashMap<&str, usize> = HashMap::new();

        for plugin in plugins {
            graph.entry(plugin.name.as_str()).or_default();
            in_degree.entry(plugin.name.as_str()).or_insert(0);
        }

        // Edge dep -> plugin: dep must load before plugin
        for plugin in plugins {
            for dep in &plugin.dependencies {
                if !names.contains(dep.as_str()) {
                    continue;
                }
                graph.entry(dep.as_str()).or_default().push(plugin.name.as_str());
                *in_degree.entry(plugin.name.as_str()).or_insert(0) += 1;
            }
        }

        // Seed in input order so independent plugins keep a stable order
        let mut queue: VecDeque<&str> = plugins
            .iter()
            .map(|p| p.name.as_str())
            .filter(|name| in_degree.get(name) == Some(&0))
            .collect();
        let mut result: Vec<String> = Vec::new();

        while let Some(name) = queue.pop_front() {
            result.push(name.to_string());

            if let Some(dependents) = graph.get(name) {
                for dependent in dependents {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(dependent);
                        }
                    }
                }
            }
        }

        if result.len() != in_degree.len() {
            let remaining: Vec<_> = plugins
                .iter()
                .map(|p| p.name.clone())
                .filter(|name| !result.contains(name))
                .collect();
            return Err(PluginError::DependencyCycle(remaining.join(" -> ")));
        }

        Ok(result)
    }
}

/// Depth-first walk from `start`'s direct dependencies.
///
/// Returns the cycle (first node repeated at the end) if a node still on the
/// current path is reached again.
fn detect_cycle(graph: &HashMap<&str, Vec<&str>>, start: &str) -> Option<Vec<String>> {
    fn visit<'a>(
        node: &'a str,
        graph: &HashMap<&'a str, Vec<&'a str>>,
        visiting: &mut Vec<&'a str>,
        visited: &mut HashSet<&'a str>,
    ) -> Option<Vec<String>> {
        if let Some(pos) = visiting.iter().position(|n| *n == node) {
            let mut cycle: Vec<String> = visiting[pos..].iter().map(|n| n.to_string()).collect();
            cycle.push(node.to_string());
            return Some(cycle);
        }
        if visited.contains(node) {
            return None;
        }

        visiting.push(node);
        if let Some(deps) = graph.get(node) {
            for dep in deps {
                if let Some(cycle) = visit(dep, graph, visiting, visited) {
                    return Some(cycle);
                }
            }
        }
        visiting.pop();
        visited.insert(node);
        None
    }

    let mut visiting = Vec::new();
    let mut visited = HashSet::new();
    for dep in graph.get(start).map(Vec::as_slice).unwrap_or(&[]) {
        if let Some(cycle) = visit(dep, graph, &mut visiting, &mut visited) {
            return Some(cycle);
        }
    }
    None
}

impl Default for DependencyResolver {
    fn default() -> Self {
        Self::new(Version::new(0, 0, 0))
    }
}
