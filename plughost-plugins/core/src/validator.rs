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

//! Static security validation of plugin packages
//!
//! Advisory checks run before anything is written to disk: archive limits,
//! file types, a fixed table of dangerous code patterns and manifest
//! permission sanity. Every check is independent; any error invalidates the
//! package, warnings never block it. Runtime enforcement is the permission
//! checker's job, not this module's.

use crate::archive::{ArchiveEntry, PluginArchive};
use crate::error::{PluginError, PluginResult};
use crate::manifest::PluginManifest;
use crate::permissions::DatabaseOperation;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

const MB: u64 = 1024 * 1024;

/// Extensions scanned for dangerous code patterns
const CODE_EXTENSIONS: &[&str] = &["js", "ts", "jsx", "tsx", "mjs", "cjs"];

/// Extensions accepted without a warning
const ALLOWED_EXTENSIONS: &[&str] = &[
    // code
    "js", "ts", "jsx", "tsx", "mjs", "cjs", "map",
    // text and data
    "json", "md", "txt", "yml", "yaml", "toml", "csv", "lock",
    // markup and styles
    "html", "htm", "xml", "css", "scss", "less",
    // images
    "svg", "png", "jpg", "jpeg", "gif", "webp", "ico", "bmp",
    // fonts
    "woff", "woff2", "ttf", "otf", "eot",
];

/// Extension-less files commonly shipped in packages
const ALLOWED_BARE_NAMES: &[&str] = &["LICENSE", "LICENCE", "README", "NOTICE", "CHANGELOG", "AUTHORS"];

/// Size and scope limits applied by the validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationLimits {
    pub max_archive_bytes: u64,
    pub max_file_bytes: u64,
    pub max_entries: usize,
    /// Endpoint count above which a warning is raised
    pub max_endpoints: usize,
    /// Table count above which a warning is raised
    pub max_tables: usize,
    /// Table count above which `delete` access is flagged
    pub max_delete_tables: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_archive_bytes: 50 * MB,
            max_file_bytes: 10 * MB,
            max_entries: 1000,
            max_endpoints: 50,
            max_tables: 20,
            max_delete_tables: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Severity {
    Error,
    Warning,
}

struct CodePattern {
    regex: Regex,
    severity: Severity,
    message: &'static str,
}

impl CodePattern {
    fn new(pattern: &str, severity: Severity, message: &'static str) -> Self {
        Self {
            regex: Regex::new(pattern).expect("valid code pattern"),
            severity,
            message,
        }
    }
}

static CODE_PATTERNS: Lazy<Vec<CodePattern>> = Lazy::new(|| {
    vec![
        CodePattern::new(r"eval\s*\(", Severity::Error, "use of eval() is not allowed"),
        CodePattern::new(
            r"new\s+Function\s*\(",
            Severity::Error,
            "use of new Function() is not allowed",
        ),
        CodePattern::new(
            r"(?:^|[^\w.$])Function\s*\(",
            Severity::Error,
            "use of the Function() constructor is not allowed",
        ),
        CodePattern::new(
            r#"(?:require|import)\s*\(\s*['"](?:node:)?child_process['"]|from\s+['"](?:node:)?child_process['"]"#,
            Severity::Error,
            "importing child_process is not allowed",
        ),
        CodePattern::new(
            r"process\s*\.\s*(?:exit|abort|kill)\s*\(",
            Severity::Error,
            "terminating the host process is not allowed",
        ),
        CodePattern::new(
            r"\.\.[/\\]\.\.[/\\]\.\.",
            Severity::Error,
            "path traversal sequence detected",
        ),
        CodePattern::new(
            r#"(?:require|import)\s*\(\s*['"](?:node:)?fs(?:/promises)?['"]|from\s+['"](?:node:)?fs(?:/promises)?['"]"#,
            Severity::Warning,
            "direct filesystem module import; use the plugin context instead",
        ),
    ]
});

/// Outcome of validating a package
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Fail with [`PluginError::ValidationFailed`] if any error was recorded
    pub fn into_result(self) -> PluginResult<Self> {
        if self.is_valid {
            Ok(self)
        } else {
            Err(PluginError::ValidationFailed(self.errors))
        }
    }
}

/// Security validator
#[derive(Debug, Clone, Default)]
pub struct SecurityValidator {
    limits: ValidationLimits,
}

impl SecurityValidator {
    pub fn new(limits: ValidationLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ValidationLimits {
        &self.limits
    }

    /// Run every check against the package
    pub fn validate_package(
        &self,
        archive: &PluginArchive,
        manifest: &PluginManifest,
    ) -> ValidationReport {
        let mut report = ValidationReport::default();

        self.check_archive_limits(archive, &mut report);
        for entry in archive.entries() {
            self.check_entry(archive, entry, &mut report);
        }
        self.check_permissions(manifest, &mut report);

        if !archive.contains(&manifest.entry.backend) {
            report.error(format!(
                "Backend entry point '{}' not found in archive",
                manifest.entry.backend
            ));
        }
        if let Some(frontend) = &manifest.entry.frontend {
            if !archive.contains(frontend) {
                report.warn(format!("Frontend entry '{}' not found in archive", frontend));
            }
        }

        report.is_valid = report.errors.is_empty();
        report
    }

    fn check_archive_limits(&self, archive: &PluginArchive, report: &mut ValidationReport) {
        if archive.size() > self.limits.max_archive_bytes {
            report.error(format!(
                "Archive size {} exceeds the maximum size limit of {}",
                human_size(archive.size()),
                human_size(self.limits.max_archive_bytes)
            ));
        }
        if archive.entry_count() > self.limits.max_entries {
            report.error(format!(
                "Archive contains {} entries, exceeding the limit of {}",
                archive.entry_count(),
                self.limits.max_entries
            ));
        }
    }

    fn check_entry(&self, archive: &PluginArchive, entry: &ArchiveEntry, report: &mut ValidationReport) {
        if entry.enclosed.is_none() {
            report.error(format!("Entry '{}' escapes the archive root", entry.name));
            return;
        }
        if entry.is_dir {
            return;
        }
        if entry.is_symlink {
            report.warn(format!("Symlink '{}' will not be extracted", entry.name));
            return;
        }

        if entry.size > self.limits.max_file_bytes {
            report.error(format!(
                "File '{}' is {}, exceeding the per-file size limit of {}",
                entry.name,
                human_size(entry.size),
                human_size(self.limits.max_file_bytes)
            ));
        }

        let extension = entry.extension();
        match extension.as_deref() {
            Some(ext) if ALLOWED_EXTENSIONS.contains(&ext) => {}
            None if is_allowed_bare_name(&entry.name) => {}
            _ => report.warn(format!("File '{}' has a disallowed file type", entry.name)),
        }

        if extension
            .as_deref()
            .map(|ext| CODE_EXTENSIONS.contains(&ext))
            .unwrap_or(false)
        {
            self.scan_code(archive, entry, report);
        }
    }

    fn scan_code(&self, archive: &PluginArchive, entry: &ArchiveEntry, report: &mut ValidationReport) {
        let bytes = match archive.read_file(&entry.name) {
            Ok(bytes) => bytes,
            Err(e) => {
                report.error(format!("Could not read '{}': {}", entry.name, e));
                return;
            }
        };
        let Ok(source) = String::from_utf8(bytes) else {
            report.warn(format!("Code file '{}' is not valid UTF-8, not scanned", entry.name));
            return;
        };

        for pattern in CODE_PATTERNS.iter() {
            if let Some(found) = pattern.regex.find(&source) {
                let line = source[..found.start()].matches('\n').count() + 1;
                let message = format!("{}:{}: {}", entry.name, line, pattern.message);
                match pattern.severity {
                    Severity::Error => report.error(message),
                    Severity::Warning => report.warn(message),
                }
            }
        }
    }

    fn check_permissions(&self, manifest: &PluginManifest, report: &mut ValidationReport) {
        let permissions = &manifest.permissions;

        if let Some(endpoints) = permissions.api.as_ref().and_then(|a| a.endpoints.as_ref()) {
            if endpoints.len() > self.limits.max_endpoints {
                report.warn(format!(
                    "Plugin declares {} API endpoints (more than {})",
                    endpoints.len(),
                    self.limits.max_endpoints
                ));
            }
            for endpoint in endpoints.iter().filter(|e| e.is_wildcard()) {
                report.warn(format!("Wildcard API endpoint permission '{}'", endpoint));
            }
        }

        if let Some(database) = &permissions.database {
            let table_count = permissions.table_count();
            if table_count > self.limits.max_tables {
                report.warn(format!(
                    "Plugin declares {} database tables (more than {})",
                    table_count, self.limits.max_tables
                ));
            }
            for table in database.tables.iter().flatten().filter(|t| t.is_wildcard()) {
                report.warn(format!("Wildcard database table permission '{}'", table));
            }
            let deletes = database
                .operations
                .as_ref()
                .map(|ops| ops.contains(&DatabaseOperation::Delete))
                .unwrap_or(false);
            if deletes && table_count > self.limits.max_delete_tables {
                report.warn(format!(
                    "Delete permission requested across {} tables",
                    table_count
                ));
            }
        }
    }
}

fn is_allowed_bare_name(name: &str) -> bool {
    let file_name = name.rsplit('/').next().unwrap_or(name);
    ALLOWED_BARE_NAMES
        .iter()
        .any(|n| file_name.eq_ignore_ascii_case(n))
}

fn human_size(bytes: u64) -> String {
    if bytes >= MB && bytes % MB == 0 {
        format!("{} MB", bytes / MB)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
