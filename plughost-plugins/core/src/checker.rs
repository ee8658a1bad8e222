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

//! Permission checker
//!
//! Stateless checks of a requested access against a plugin's declared
//! [`PermissionSet`]. An absent facet denies everything of that kind. The
//! `enforce_*` variants turn a denial into [`PluginError::PermissionDenied`]
//! and are what the plugin context calls on every host access.

use crate::error::{PluginError, PluginResult};
use crate::permissions::{DatabaseOperation, ModuleAction, PermissionSet, UiResource};

/// May the plugin call `endpoint` with `method`?
pub fn check_api(permissions: &PermissionSet, endpoint: &str, method: &str) -> bool {
    let Some(api) = &permissions.api else {
        return false;
    };

    if let Some(endpoints) = &api.endpoints {
        if !endpoints.iter().any(|p| p.matches(endpoint)) {
            return false;
        }
    }

    if let Some(methods) = &api.methods {
        if !methods.iter().any(|m| m.eq_ignore_ascii_case(method)) {
            return false;
        }
    }

    true
}

/// May the plugin perform `operation` on `table`?
pub fn check_database(
    permissions: &PermissionSet,
    table: &str,
    operation: DatabaseOperation,
) -> bool {
    let Some(database) = &permissions.database else {
        return false;
    };

    if let Some(tables) = &database.tables {
        if !tables.iter().any(|p| p.matches(table)) {
            return false;
        }
    }

    if let Some(operations) = &database.operations {
        if !operations.contains(&operation) {
            return false;
        }
    }

    true
}

/// May the plugin create a module, or extend `module_name`?
pub fn check_module(
    permissions: &PermissionSet,
    action: ModuleAction,
    module_name: Option<&str>,
) -> bool {
    let Some(modules) = &permissions.modules else {
        return false;
    };

    match action {
        ModuleAction::Create => modules.create,
        ModuleAction::Extend => match module_name {
            Some(name) => modules.extend.iter().any(|m| m == name),
            None => false,
        },
    }
}

/// May the plugin contribute the named UI component or page?
pub fn check_ui(permissions: &PermissionSet, resource: UiResource, name: &str) -> bool {
    let Some(ui) = &permissions.ui else {
        return false;
    };

    let declared = match resource {
        UiResource::Component => &ui.components,
        UiResource::Page => &ui.pages,
    };
    declared.iter().any(|d| d == name)
}

pub fn enforce_api(
    plugin: &str,
    permissions: &PermissionSet,
    endpoint: &str,
    method: &str,
) -> PluginResult<()> {
    if check_api(permissions, endpoint, method) {
        Ok(())
    } else {
        Err(PluginError::denied(
            plugin,
            format!("API {} {}", method.to_ascii_uppercase(), endpoint),
        ))
    }
}

pub fn enforce_database(
    plugin: &str,
    permissions: &PermissionSet,
    table: &str,
    operation: DatabaseOperation,
) -> PluginResult<()> {
    if check_database(permissions, table, operation) {
        Ok(())
    } else {
        Err(PluginError::denied(
            plugin,
            format!("database {} on table '{}'", operation, table),
        ))
    }
}

pub fn enforce_module(
    plugin: &str,
    permissions: &PermissionSet,
    action: ModuleAction,
    module_name: Option<&str>,
) -> PluginResult<()> {
    if check_module(permissions, action, module_name) {
        return Ok(());
    }
    let resource = match (action, module_name) {
        (ModuleAction::Create, _) => "module create".to_string(),
        (ModuleAction::Extend, Some(name)) => format!("module extend '{}'", name),
        (ModuleAction::Extend, None) => "module extend".to_string(),
    };
    Err(PluginError::denied(plugin, resource))
}

pub fn enforce_ui(
    plugin: &str,
    permissions: &PermissionSet,
    resource: UiResource,
    name: &str,
) -> PluginResult<()> {
    if check_ui(permissions, resource, name) {
        return Ok(());
    }
    let kind = match resource {
        UiResource::Component => "component",
        UiResource::Page => "page",
    };
    Err(PluginError::denied(plugin, format!("ui {} '{}'", kind, name)))
}
