//! Plugin registry.
//!
//! Holds every plugin the kernel knows about, keyed by id. The registry is
//! seeded with the built-in catalogue and extended with manifests found in
//! the configured plugin directories; a directory plugin with the same id as
//! a built-in replaces it.
//!
//! # Capability filtering
//!
//! Before the plan is compiled, [`PluginRegistry::select`] drops plugins
//! that cannot test the target (wrong target type) or whose families the
//! policy does not ask for. Each drop is returned with a reason so the
//! kernel can audit it.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use super::{ManifestPlugin, Plugin, PluginError, PluginManifest, builtin_manifests, MANIFEST_FILE};
use crate::domain::{Plan, Policy, Target};

/// A plan entry that will not run, and why
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedPlugin {
    pub id: String,
    /// Machine-readable reason, used in audit records and the report
    pub reason: &'static str,
    pub detail: String,
}

impl SkippedPlugin {
    fn new(id: &str, reason: &'static str, detail: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            reason,
            detail: detail.into(),
        }
    }
}

/// Registry of plugin adapters.
///
/// Plugins are stored as `Arc<dyn Plugin>`, so the registry is cheap to
/// clone and share across worker tasks.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in catalogue
    pub fn with_builtins() -> Result<Self, PluginError> {
        let mut registry = Self::new();
        for manifest in builtin_manifests()? {
            registry.register(Arc::new(ManifestPlugin::new(manifest)));
        }
        Ok(registry)
    }

    /// Registers a plugin, replacing any plugin with the same id
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        let id = plugin.meta().id.clone();
        if self.plugins.insert(id.clone(), plugin).is_some() {
            debug!("Plugin {} replaced by a later registration", id);
        }
    }

    /// Load every `plugin.yaml` directly inside `dir` or one level below it.
    ///
    /// Invalid manifests are skipped with a warning so one broken plugin
    /// does not take the others down. Returns the ids that were loaded.
    pub fn load_dir(&mut self, dir: &Path) -> Vec<String> {
        let mut loaded = Vec::new();
        if !dir.is_dir() {
            warn!("Plugin directory {} does not exist", dir.display());
            return loaded;
        }

        let mut candidates = vec![dir.join(MANIFEST_FILE)];
        let pattern = dir.join("*").join(MANIFEST_FILE);
        match glob::glob(&pattern.to_string_lossy()) {
            Ok(paths) => candidates.extend(paths.flatten()),
            Err(e) => warn!("Invalid plugin search pattern {}: {}", pattern.display(), e),
        }

        for path in candidates.into_iter().filter(|p| p.is_file()) {
            match PluginManifest::load(&path) {
                Ok(manifest) => {
                    debug!("Loaded plugin {} from {}", manifest.id, path.display());
                    loaded.push(manifest.id.clone());
                    self.register(Arc::new(ManifestPlugin::new(manifest)));
                }
                Err(e) => warn!("Skipping plugin: {}", e),
            }
        }
        loaded
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.plugins.contains_key(id)
    }

    /// All registered ids, sorted
    pub fn ids(&self) -> Vec<&str> {
        self.plugins.keys().map(String::as_str).collect()
    }

    pub fn plugins(&self) -> impl Iterator<Item = &Arc<dyn Plugin>> {
        self.plugins.values()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Resolve the plan's plugins and filter them by capability.
    ///
    /// Returns the runnable plugins in plan order plus every skipped entry.
    pub fn select(
        &self,
        plan: &Plan,
        target: &Target,
        policy: &Policy,
    ) -> (Vec<Arc<dyn Plugin>>, Vec<SkippedPlugin>) {
        let mut selected = Vec::new();
        let mut skipped = Vec::new();

        for entry in &plan.plugins {
            let Some(plugin) = self.get(&entry.id) else {
                skipped.push(SkippedPlugin::new(&entry.id, "unknown_plugin", "no plugin with this id is installed"));
                continue;
            };
            let caps = plugin.capabilities();
            if !caps.supports_target(target.target_type) {
                skipped.push(SkippedPlugin::new(
                    &entry.id,
                    "target_type_unsupported",
                    format!("plugin does not test {} targets", target.target_type.as_str()),
                ));
                continue;
            }
            if !caps.overlaps(policy) {
                let families: Vec<&str> = caps.families.iter().map(|f| f.as_str()).collect();
                skipped.push(SkippedPlugin::new(
                    &entry.id,
                    "family_not_in_policy",
                    format!("plugin families [{}] are not enabled by the policy", families.join(", ")),
                ));
                continue;
            }
            selected.push(plugin);
        }
        (selected, skipped)
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry").field("plugins", &self.ids()).finish()
    }
}
