//! Plugin catalogue commands

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Subcommand;

use testuniverse::config::Settings;
use testuniverse::plugin::{Plugin, PluginManifest, PluginRegistry};

#[derive(Debug, Subcommand)]
pub enum PluginsCommand {
    /// List built-in plugins and plugins from the configured directories
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one plugin's capabilities and dependencies
    Info {
        /// Plugin id
        id: String,
    },

    /// Check a plugin.yaml (or a directory containing one)
    Validate {
        path: PathBuf,
    },
}

fn load_registry(config_path: Option<&Path>) -> Result<PluginRegistry> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    let settings = Settings::resolve(config_path, &cwd, &|name| std::env::var(name).ok())?;
    let mut registry = PluginRegistry::with_builtins()?;
    for dir in &settings.plugin_dirs {
        registry.load_dir(dir);
    }
    Ok(registry)
}

fn describe(plugin: &dyn Plugin) -> serde_json::Value {
    serde_json::json!({
        "meta": plugin.meta(),
        "capabilities": plugin.capabilities(),
        "dependencies": plugin.dependencies(),
        "base_confidence": plugin.base_confidence(),
    })
}

fn list(registry: &PluginRegistry, json: bool) -> Result<()> {
    if json {
        let all: Vec<_> = registry.plugins().map(|p| describe(p.as_ref())).collect();
        println!("{}", serde_json::to_string_pretty(&all)?);
        return Ok(());
    }
    if registry.is_empty() {
        println!("No plugins installed.");
        return Ok(());
    }

    println!(
        "{:<18} {:<9} {:<14} {:<8} {:<28} TARGETS",
        "ID", "VERSION", "TOOL", "TRAFFIC", "FAMILIES"
    );
    println!("{}", "-".repeat(90));
    for plugin in registry.plugins() {
        let meta = plugin.meta();
        let caps = plugin.capabilities();
        let families: Vec<&str> = caps.families.iter().map(|f| f.as_str()).collect();
        let targets: Vec<&str> = caps.target_types.iter().map(|t| t.as_str()).collect();
        println!(
            "{:<18} {:<9} {:<14} {:<8} {:<28} {}",
            meta.id,
            meta.version,
            meta.tool,
            caps.traffic.as_str(),
            families.join(","),
            targets.join(",")
        );
    }
    Ok(())
}

fn info(registry: &PluginRegistry, id: &str) -> Result<i32> {
    let Some(plugin) = registry.get(id) else {
        eprintln!("Unknown plugin: {}", id);
        return Ok(1);
    };
    let meta = plugin.meta();
    let caps = plugin.capabilities();

    println!("{} {} ({})", meta.id, meta.version, meta.name);
    println!("  Tool:            {}", meta.tool);
    println!("  Traffic:         {}", caps.traffic.as_str());
    let families: Vec<&str> = caps.families.iter().map(|f| f.as_str()).collect();
    println!("  Families:        {}", families.join(", "));
    let targets: Vec<&str> = caps.target_types.iter().map(|t| t.as_str()).collect();
    println!("  Target types:    {}", targets.join(", "));
    if !caps.evidence_types.is_empty() {
        println!("  Evidence:        {}", caps.evidence_types.join(", "));
    }
    if !plugin.dependencies().is_empty() {
        println!("  Depends on:      {}", plugin.dependencies().join(", "));
    }
    println!("  Base confidence: {:.2}", plugin.base_confidence());
    Ok(0)
}

fn validate(path: &Path) -> i32 {
    match PluginManifest::load(path) {
        Ok(manifest) => {
            println!("OK: {} {} ({})", manifest.id, manifest.version, manifest.execution.output_format.as_str());
            0
        }
        Err(e) => {
            eprintln!("Invalid: {}", e);
            1
        }
    }
}

pub fn plugins_command(command: PluginsCommand, config_path: Option<&Path>) -> Result<i32> {
    match command {
        PluginsCommand::List { json } => {
            list(&load_registry(config_path)?, json)?;
            Ok(0)
        }
        PluginsCommand::Info { id } => info(&load_registry(config_path)?, &id),
        PluginsCommand::Validate { path } => Ok(validate(&path)),
    }
}
