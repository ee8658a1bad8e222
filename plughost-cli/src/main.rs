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

//! Plughost CLI
//!
//! Command-line interface for validating, installing and managing plugins.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use plughost_plugins::telemetry::init_tracing;
use plughost_plugins::{
    AuditLogger, AuditQuery, HostServices, JsonFilePluginStore, NativeEntryLoader, Plugin,
    PluginArchive, PluginConfig, PluginEventType, PluginManager, SecurityValidator,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "plughost")]
#[command(about = "Plughost - plugin lifecycle manager", long_about = None)]
struct Cli {
    /// Data directory (overrides config and PLUGHOST_DATA_DIR)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Tenant the command acts on
    #[arg(short, long, default_value = "default")]
    tenant: String,

    /// Verbose mode
    #[arg(short, long)]
    verbose: bool,

    /// Output as JSON (machine-readable)
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the security validator over a package without installing it
    Validate {
        /// Package file (.zip) or plugin directory
        path: PathBuf,
    },

    /// Show a package's manifest and requested permissions
    Inspect {
        /// Package file (.zip) or plugin directory
        path: PathBuf,
    },

    /// Package a plugin directory into a .zip
    Pack {
        /// Plugin directory containing manifest.json
        dir: PathBuf,

        /// Output file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Install a package
    Install {
        /// Package file (.zip) or plugin directory
        path: PathBuf,

        /// Activate right after installing
        #[arg(long)]
        activate: bool,
    },

    /// Activate an installed plugin
    Activate {
        /// Plugin ID or name
        plugin: String,
    },

    /// Deactivate a plugin
    Deactivate {
        /// Plugin ID or name
        plugin: String,
    },

    /// Uninstall a plugin
    Uninstall {
        /// Plugin ID or name
        plugin: String,
    },

    /// List installed plugins
    List,

    /// Query the audit log
    Audit {
        /// Plugin ID or name
        #[arg(long)]
        plugin: Option<String>,

        /// Event type (installed, activated, deactivated, uninstalled, failed, operation)
        #[arg(long)]
        event: Option<PluginEventType>,

        /// Only entries at or after this RFC 3339 timestamp
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// Only entries at or before this RFC 3339 timestamp
        #[arg(long)]
        until: Option<DateTime<Utc>>,

        /// Most recent N entries
        #[arg(long)]
        limit: Option<usize>,
    },
}

impl Commands {
    /// Commands that load or unload plugin runtimes
    fn touches_runtime(&self) -> bool {
        matches!(
            self,
            Commands::Install { .. }
                | Commands::Activate { .. }
                | Commands::Deactivate { .. }
                | Commands::Uninstall { .. }
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose && std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "debug");
    }
    init_tracing(cli.json)?;

    let config = load_config(&cli)?;
    debug!(data_dir = %config.data_dir.display(), "Loaded configuration");

    // Package commands don't need the store
    match &cli.command {
        Commands::Validate { path } => return validate(&config, path, cli.json),
        Commands::Inspect { path } => return inspect(path, cli.json),
        Commands::Pack { dir, output } => return pack(dir, output.as_deref()),
        _ => {}
    }

    let store = JsonFilePluginStore::open(config.store_path())
        .await
        .context("Failed to open plugin store")?;
    let audit = Arc::new(
        AuditLogger::open(config.audit_log_path()).context("Failed to open audit log")?,
    );
    let manager = PluginManager::new(
        config.clone(),
        Arc::new(store),
        Arc::new(NativeEntryLoader::new()),
        HostServices::default(),
    )
    .await
    .context("Failed to initialize plugin manager")?;
    let _subscription = audit.attach(manager.events());

    // Runtimes only live as long as this process: reload the ones recorded
    // Active so deactivate and uninstall reach their cleanup, unload on exit
    if cli.command.touches_runtime() {
        let summary = manager
            .restore_active(&cli.tenant)
            .await
            .context("Failed to restore active plugins")?;
        for (name, error) in &summary.failed {
            warn!(plugin = %name, %error, "Plugin could not be restored");
        }
    }

    let outcome = run(&cli, &config, &manager, &audit).await;
    manager.shutdown().await;
    if let Err(e) = audit.flush() {
        warn!(error = %e, "Failed to flush audit log");
    }
    outcome
}

async fn run(
    cli: &Cli,
    config: &PluginConfig,
    manager: &PluginManager,
    audit: &AuditLogger,
) -> Result<()> {
    let tenant = cli.tenant.as_str();
    match &cli.command {
        // Handled in main
        Commands::Validate { .. } | Commands::Inspect { .. } | Commands::Pack { .. } => {}

        Commands::Install { path, activate } => {
            let bytes = read_package(path)?;
            let mut plugin = manager
                .install(bytes, tenant)
                .await
                .with_context(|| format!("Failed to install {}", path.display()))?;
            if *activate {
                plugin = manager
                    .activate(plugin.id, tenant)
                    .await
                    .context("Installed, but activation failed")?;
            }
            print_plugin(&plugin, "Installed", cli.json)?;
        }

        Commands::Activate { plugin } => {
            let id = resolve_plugin(manager, tenant, plugin).await?;
            let plugin = manager.activate(id, tenant).await.context("Activation failed")?;
            print_plugin(&plugin, "Activated", cli.json)?;
        }

        Commands::Deactivate { plugin } => {
            let id = resolve_plugin(manager, tenant, plugin).await?;
            let plugin = manager
                .deactivate(id, tenant)
                .await
                .context("Deactivation failed")?;
            print_plugin(&plugin, "Deactivated", cli.json)?;
        }

        Commands::Uninstall { plugin } => {
            let id = resolve_plugin(manager, tenant, plugin).await?;
            manager.uninstall(id, tenant).await.context("Uninstall failed")?;
            if cli.json {
                println!("{}", serde_json::json!({ "uninstalled": id }));
            } else {
                println!("✓ Uninstalled {}", plugin);
            }
        }

        Commands::List => {
            let plugins = manager.list_plugins(tenant).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&plugins)?);
            } else if plugins.is_empty() {
                println!("No plugins installed for tenant '{}'.", tenant);
                println!("\nPlugins directory: {}", config.plugins_dir().display());
            } else {
                println!("Installed Plugins ({}):", plugins.len());
                println!("{:-<60}", "");
                for plugin in &plugins {
                    println!("{} v{} [{}]", plugin.name(), plugin.version(), plugin.status);
                    println!("    ID: {}", plugin.id);
                    if let Some(description) = &plugin.manifest.description {
                        println!("    Description: {}", description);
                    }
                    if let Some(error) = &plugin.last_error {
                        println!("    Error: {}", error);
                    }
                    println!();
                }
            }
        }

        Commands::Audit {
            plugin,
            event,
            since,
            until,
            limit,
        } => {
            let plugin_id = match plugin {
                Some(p) => Some(resolve_plugin(manager, tenant, p).await?),
                None => None,
            };
            let query = AuditQuery {
                plugin_id,
                tenant_id: Some(tenant.to_string()),
                event_type: *event,
                from: *since,
                to: *until,
                limit: *limit,
            };
            let entries = audit.query_logs(&query)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in &entries {
                    let outcome = if entry.success { "ok" } else { "FAILED" };
                    println!(
                        "{} {:<22} {:<24} {}",
                        entry.timestamp.to_rfc3339(),
                        entry.action,
                        entry.plugin_name,
                        outcome
                    );
                    if let Some(error) = &entry.error {
                        println!("    {}", error);
                    }
                }
                println!("{} entries", entries.len());
            }
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<PluginConfig> {
    let mut config = match &cli.config {
        Some(path) => PluginConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => PluginConfig::from_env().context("Invalid PLUGHOST_* environment")?,
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    Ok(config)
}

/// Read a .zip package, or pack a directory on the fly
fn read_package(path: &Path) -> Result<Vec<u8>> {
    if path.is_dir() {
        PluginArchive::pack_dir(path).with_context(|| format!("Failed to pack {}", path.display()))
    } else {
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
    }
}

fn open_package(path: &Path) -> Result<PluginArchive> {
    PluginArchive::from_bytes(read_package(path)?).context("Not a valid plugin package")
}

fn validate(config: &PluginConfig, path: &Path, json: bool) -> Result<()> {
    let archive = open_package(path)?;
    let manifest = archive.manifest().context("Failed to read manifest")?;
    let report = SecurityValidator::new(config.limits.clone()).validate_package(&archive, &manifest);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for error in &report.errors {
            println!("✗ {}", error);
        }
        for warning in &report.warnings {
            println!("! {}", warning);
        }
        if report.is_valid {
            println!("✓ {} v{} is valid", manifest.name, manifest.version);
        }
    }

    if !report.is_valid {
        anyhow::bail!("{} failed validation with {} error(s)", manifest.name, report.errors.len());
    }
    Ok(())
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let archive = open_package(path)?;
    let manifest = archive.manifest().context("Failed to read manifest")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&manifest)?);
        return Ok(());
    }

    println!("{} v{} ({:?})", manifest.name, manifest.version, manifest.plugin_type);
    if let Some(description) = &manifest.description {
        println!("  {}", description);
    }
    println!("  Backend: {}", manifest.entry.backend);
    if let Some(frontend) = &manifest.entry.frontend {
        println!("  Frontend: {}", frontend);
    }
    println!("  Files: {} ({} bytes)", archive.entry_count(), archive.size());
    println!("  Manifest hash: {}", manifest.content_hash());

    let permissions = manifest.permissions.describe();
    if permissions.is_empty() {
        println!("  Permissions: none");
    } else {
        println!("  Permissions:");
        for line in permissions {
            println!("    - {}", line);
        }
    }

    if !manifest.dependencies.plugins.is_empty() {
        println!("  Depends on:");
        for dep in &manifest.dependencies.plugins {
            println!("    - {} {}", dep.name, dep.version.as_str());
        }
    }
    Ok(())
}

fn pack(dir: &Path, output: Option<&Path>) -> Result<()> {
    let bytes = PluginArchive::pack_dir(dir).with_context(|| format!("Failed to pack {}", dir.display()))?;
    let manifest = PluginArchive::from_bytes(bytes.clone())?
        .manifest()
        .context("Packed directory has no valid manifest.json")?;

    let output = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(format!("{}-{}.zip", manifest.name, manifest.version)));
    std::fs::write(&output, &bytes).with_context(|| format!("Failed to write {}", output.display()))?;
    println!("✓ Wrote {} ({} bytes)", output.display(), bytes.len());
    Ok(())
}

/// Accept either a plugin id or a plugin name
async fn resolve_plugin(manager: &PluginManager, tenant: &str, plugin: &str) -> Result<Uuid> {
    if let Ok(id) = Uuid::parse_str(plugin) {
        return Ok(id);
    }
    let found = manager
        .get_plugin_by_name(tenant, plugin)
        .await
        .with_context(|| format!("No plugin named '{}' for tenant '{}'", plugin, tenant))?;
    Ok(found.id)
}

fn print_plugin(plugin: &Plugin, verb: &str, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(plugin)?);
    } else {
        println!("✓ {} {} v{}", verb, plugin.name(), plugin.version());
        println!("    ID: {}", plugin.id);
        println!("    Status: {}", plugin.status);
    }
    Ok(())
}
