//! Plugin Interface
//!
//! A plugin wraps one external testing tool. The kernel only ever talks to
//! it through [`Plugin`]: `configure()` turns the run inputs into an
//! [`ExecutionSpec`] for the sandbox, and `normalize()` turns the captured
//! artifacts back into candidate findings. Adapters are data: every built-in
//! plugin is a [`PluginManifest`] interpreted by [`ManifestPlugin`], and the
//! only tool-specific code paths are the output [`formats`].

pub mod artifacts;
mod builtin;
pub mod formats;
mod manifest;
mod registry;

use serde::{Deserialize, Serialize};

use crate::domain::{
    ExecutionResult, ExecutionSpec, Family, Plan, Policy, Target, TargetType, TrafficClass,
};
use crate::normalize::PluginOutput;

pub use builtin::{BUILTIN_PLUGIN_IDS, builtin_manifests};
pub use formats::OutputFormat;
pub use manifest::{
    ExecutionTemplate, MANIFEST_FILE, ManifestPlugin, PluginManifest, ResourceRequirements,
    ToolRequirement,
};
pub use registry::{PluginRegistry, SkippedPlugin};

/// Confidence assigned to findings when a plugin declares none
pub const DEFAULT_BASE_CONFIDENCE: f64 = 0.5;

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("Invalid plugin manifest {path}: {message}")]
    InvalidManifest { path: String, message: String },

    #[error("Failed to read plugin manifest {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Plugin '{plugin}' cannot be configured: {message}")]
    Configure { plugin: String, message: String },

    #[error("Unknown plugin: {0}")]
    Unknown(String),
}

/// Static identity of a plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginMeta {
    pub id: String,
    pub name: String,
    pub version: String,
    /// Name of the wrapped external tool
    pub tool: String,
}

/// What a plugin can test and how it touches the target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub target_types: Vec<TargetType>,
    pub families: Vec<Family>,
    #[serde(default)]
    pub evidence_types: Vec<String>,
    #[serde(default)]
    pub traffic: TrafficClass,
}

impl Capabilities {
    pub fn supports_target(&self, target_type: TargetType) -> bool {
        self.target_types.contains(&target_type)
    }

    /// True if at least one family is wanted by the policy
    pub fn overlaps(&self, policy: &Policy) -> bool {
        self.families.iter().any(|f| policy.covers_family(*f))
    }
}

/// A testing tool adapter
pub trait Plugin: Send + Sync {
    fn meta(&self) -> &PluginMeta;

    fn capabilities(&self) -> &Capabilities;

    /// Ids of plugins that must run first (merged into the plan as hard edges)
    fn dependencies(&self) -> &[String] {
        &[]
    }

    /// Starting confidence for findings this plugin reports
    fn base_confidence(&self) -> f64 {
        DEFAULT_BASE_CONFIDENCE
    }

    /// Build the sandbox job for this run
    fn configure(&self, target: &Target, policy: &Policy, plan: &Plan) -> Result<ExecutionSpec, PluginError>;

    /// Turn captured artifacts into candidate findings. Candidates are
    /// validated and redacted by the normalizer afterwards.
    fn normalize(&self, result: &ExecutionResult) -> PluginOutput;
}
