//! `plugin.yaml` manifests and the adapter that interprets them

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::formats::{FormatContext, OutputFormat};
use super::{Capabilities, Plugin, PluginError, PluginMeta, artifacts, DEFAULT_BASE_CONFIDENCE};
use crate::domain::{
    Artifact, ExecutionResult, ExecutionSpec, Family, Plan, Policy, STDOUT_ARTIFACT, Target,
};
use crate::normalize::PluginOutput;

pub const MANIFEST_FILE: &str = "plugin.yaml";

static PLUGIN_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9._-]*$").expect("valid regex"));

/// Prefix of template variables read from plan configuration
const CONFIG_PREFIX: &str = "config.";

fn default_memory_mb() -> u64 {
    512
}

fn default_timeout_seconds() -> u64 {
    300
}

fn default_success_codes() -> Vec<i32> {
    vec![0]
}

fn default_base_confidence() -> f64 {
    DEFAULT_BASE_CONFIDENCE
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequirement {
    pub name: String,
    /// Semver requirement, e.g. `>=2.0`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Human readable install hint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            memory_mb: default_memory_mb(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

/// How to launch the tool.
///
/// `command` and `environment` values may use `{target_url}`, `{target_host}`,
/// `{target_id}`, `{target_type}`, `{timeout_seconds}`, `{rate_limit}`,
/// `{mode}` and `{config.<key>}`. `{output_dir}` and `{seed_urls_file}` are
/// left for the sandbox, which knows the job directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub command: Vec<String>,
    /// Values of the form `env:NAME` are read from the kernel environment at launch
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub output_files: Vec<String>,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry_file: Option<String>,
    #[serde(default)]
    pub unreachable_exit_codes: Vec<i32>,
    #[serde(default = "default_success_codes")]
    pub success_exit_codes: Vec<i32>,
    /// Defaults for `{config.<key>}` when the plan does not set the key
    #[serde(default)]
    pub defaults: BTreeMap<String, Value>,
}

/// A parsed `plugin.yaml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub tool: ToolRequirement,
    pub capabilities: Capabilities,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub execution: ExecutionTemplate,
    #[serde(default = "default_base_confidence")]
    pub base_confidence: f64,
    /// File the manifest was loaded from
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

fn is_safe_relative(name: &str) -> bool {
    let path = Path::new(name);
    !name.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

impl PluginManifest {
    pub fn from_yaml(content: &str, origin: &str) -> Result<Self, PluginError> {
        let manifest: PluginManifest =
            serde_yaml::from_str(content).map_err(|e| PluginError::InvalidManifest {
                path: origin.to_string(),
                message: e.to_string(),
            })?;
        manifest.validate(origin)?;
        Ok(manifest)
    }

    /// Load from a manifest file or a plugin directory containing `plugin.yaml`
    pub fn load(path: &Path) -> Result<Self, PluginError> {
        let file = if path.is_dir() {
            path.join(MANIFEST_FILE)
        } else {
            path.to_path_buf()
        };
        let origin = file.display().to_string();
        let content = std::fs::read_to_string(&file).map_err(|source| PluginError::Io {
            path: origin.clone(),
            source,
        })?;
        let mut manifest = Self::from_yaml(&content, &origin)?;
        manifest.source = Some(file);
        Ok(manifest)
    }

    /// Every problem with this manifest, empty when it is valid
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if !PLUGIN_ID_RE.is_match(&self.id) {
            problems.push(format!("id '{}' must match ^[a-z0-9][a-z0-9._-]*$", self.id));
        }
        if self.name.trim().is_empty() {
            problems.push("name is empty".to_string());
        }
        if let Err(e) = semver::Version::parse(&self.version) {
            problems.push(format!("version '{}' is not semver: {}", self.version, e));
        }
        if self.tool.name.trim().is_empty() {
            problems.push("tool.name is empty".to_string());
        }
        if let Some(req) = &self.tool.version {
            if let Err(e) = semver::VersionReq::parse(req) {
                problems.push(format!("tool.version '{}' is not a version requirement: {}", req, e));
            }
        }
        if self.capabilities.target_types.is_empty() {
            problems.push("capabilities.target_types is empty".to_string());
        }
        if self.capabilities.families.is_empty() {
            problems.push("capabilities.families is empty".to_string());
        }
        if self.resources.timeout_seconds == 0 {
            problems.push("resources.timeout_seconds must be positive".to_string());
        }
        if self.execution.command.is_empty() {
            problems.push("execution.command is empty".to_string());
        }
        for name in self
            .execution
            .output_files
            .iter()
            .chain(self.execution.telemetry_file.iter())
        {
            if !is_safe_relative(name) {
                problems.push(format!("output file '{}' must be a relative path inside the job directory", name));
            }
        }
        if !(0.0..=1.0).contains(&self.base_confidence) {
            problems.push(format!("base_confidence {} is outside [0, 1]", self.base_confidence));
        }
        if self.dependencies.contains(&self.id) {
            problems.push("plugin depends on itself".to_string());
        }
        problems
    }

    pub fn validate(&self, origin: &str) -> Result<(), PluginError> {
        let problems = self.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(PluginError::InvalidManifest {
                path: origin.to_string(),
                message: problems.join("; "),
            })
        }
    }

    /// Whether an installed tool version satisfies `tool.version`
    pub fn accepts_tool_version(&self, installed: &str) -> bool {
        let Some(req) = self.tool.version.as_deref() else {
            return true;
        };
        match (semver::VersionReq::parse(req), semver::Version::parse(installed)) {
            (Ok(req), Ok(version)) => req.matches(&version),
            _ => false,
        }
    }
}

/// A plugin driven entirely by its manifest
#[derive(Debug, Clone)]
pub struct ManifestPlugin {
    manifest: PluginManifest,
    meta: PluginMeta,
}

impl ManifestPlugin {
    pub fn new(manifest: PluginManifest) -> Self {
        let meta = PluginMeta {
            id: manifest.id.clone(),
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            tool: manifest.tool.name.clone(),
        };
        Self { manifest, meta }
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    fn primary_family(&self) -> Family {
        self.manifest
            .capabilities
            .families
            .first()
            .copied()
            .unwrap_or(Family::Functional)
    }

    /// Declared output files that hold findings (not URL lists or telemetry)
    fn report_files(&self) -> impl Iterator<Item = &String> {
        let telemetry = self.manifest.execution.telemetry_file.as_deref();
        self.manifest
            .execution
            .output_files
            .iter()
            .filter(|name| name.as_str() != artifacts::DISCOVERED_URLS_ARTIFACT)
            .filter(move |name| Some(name.as_str()) != telemetry)
    }

    /// The artifact holding the tool's report. Stdout is the report only
    /// when the manifest declares no output files at all.
    fn primary_artifact<'r>(&self, result: &'r ExecutionResult) -> Option<&'r Artifact> {
        if self.manifest.execution.output_files.is_empty() {
            return result.artifact(STDOUT_ARTIFACT);
        }
        self.report_files().find_map(|name| result.artifact(name))
    }
}

struct TemplateVars<'a> {
    builtin: BTreeMap<&'static str, String>,
    config: &'a BTreeMap<String, Value>,
}

fn config_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(config_value).collect::<Vec<_>>().join(","),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl TemplateVars<'_> {
    /// Replace every known `{name}`; unknown braces are left untouched
    fn render(&self, template: &str) -> Result<String, String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let Some(close) = after.find('}') else {
                out.push_str(&rest[open..]);
                return Ok(out);
            };
            let name = &after[..close];
            if let Some(value) = self.builtin.get(name) {
                out.push_str(value);
            } else if let Some(key) = name.strip_prefix(CONFIG_PREFIX) {
                let value = self
                    .config
                    .get(key)
                    .ok_or_else(|| format!("missing configuration key '{}'", key))?;
                out.push_str(&config_value(value));
            } else {
                out.push('{');
                out.push_str(name);
                out.push('}');
            }
            rest = &after[close + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

impl Plugin for ManifestPlugin {
    fn meta(&self) -> &PluginMeta {
        &self.meta
    }

    fn capabilities(&self) -> &Capabilities {
        &self.manifest.capabilities
    }

    fn dependencies(&self) -> &[String] {
        &self.manifest.dependencies
    }

    fn base_confidence(&self) -> f64 {
        self.manifest.base_confidence
    }

    fn configure(&self, target: &Target, policy: &Policy, plan: &Plan) -> Result<ExecutionSpec, PluginError> {
        let exec = &self.manifest.execution;
        let configure_err = |message: String| PluginError::Configure {
            plugin: self.manifest.id.clone(),
            message,
        };

        let timebox = plan
            .timebox_seconds
            .map_or(policy.timebox_seconds, |t| t.min(policy.timebox_seconds));
        let timeout_seconds = self.manifest.resources.timeout_seconds.min(timebox).max(1);

        let mut config = exec.defaults.clone();
        config.extend(plan.config_for(&self.manifest.id));

        let mut builtin = BTreeMap::new();
        builtin.insert("target_url", target.url.clone());
        builtin.insert("target_host", target.host().unwrap_or_default());
        builtin.insert("target_id", target.id.clone());
        builtin.insert("target_type", target.target_type.as_str().to_string());
        builtin.insert("timeout_seconds", timeout_seconds.to_string());
        builtin.insert(
            "rate_limit",
            format!("{}", policy.rate_limit_for(plan.mode).requests_per_second),
        );
        builtin.insert("mode", plan.mode.as_str().to_string());
        let vars = TemplateVars {
            builtin,
            config: &config,
        };

        let command = exec
            .command
            .iter()
            .map(|arg| vars.render(arg))
            .collect::<Result<Vec<_>, _>>()
            .map_err(configure_err)?;

        let mut spec = ExecutionSpec::new(self.manifest.id.clone(), command)
            .with_timeout(Duration::from_secs(timeout_seconds))
            .with_memory_mb(self.manifest.resources.memory_mb)
            .with_traffic(self.manifest.capabilities.traffic)
            .with_env("TESTUNIVERSE_TARGET_URL", target.url.clone());
        spec.image = exec.image.clone();
        spec.telemetry_file = exec.telemetry_file.clone();
        spec.unreachable_exit_codes = exec.unreachable_exit_codes.clone();
        spec.success_exit_codes = exec.success_exit_codes.clone();
        spec.target_host = target.host();

        for (key, value) in &exec.environment {
            let value = vars.render(value).map_err(configure_err)?;
            spec = spec.with_env(key.clone(), value);
        }
        // Credentials travel by reference and are resolved at launch
        if let Some(auth) = &target.auth {
            for name in auth.env_vars() {
                spec = spec.with_env(name, format!("env:{}", name));
            }
        }

        for name in &exec.output_files {
            spec = spec.with_output_file(name.clone());
        }
        Ok(spec)
    }

    fn normalize(&self, result: &ExecutionResult) -> PluginOutput {
        let Some(artifact) = self.primary_artifact(result) else {
            let mut output = PluginOutput::new();
            if self.report_files().next().is_some() {
                output
                    .warnings
                    .push(format!("{} produced no report file", self.manifest.id));
            }
            return output;
        };

        let ctx = FormatContext::new(self.manifest.id.clone(), self.primary_family())
            .with_tool(self.manifest.tool.name.clone(), self.manifest.tool.version.clone())
            .with_base_confidence(self.manifest.base_confidence)
            .with_artifact_ref(artifact.reference());
        self.manifest.execution.output_format.parse(&artifact.text(), &ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AuthDescriptor, ExecutionStatus, PlanEntry, TargetType, TrafficClass};
    use serde_json::json;

    const MANIFEST: &str = r#"
id: plugin.my-tool
name: My Tool
version: 1.0.0
author: Test Author
tool:
  name: mytool
  version: ">=2.0"
  install: "pip install mytool"
capabilities:
  target_types: [web, api]
  families: [security]
  evidence_types: [json]
  traffic: passive
resources:
  memory_mb: 256
  timeout_seconds: 900
dependencies: [recon]
execution:
  image: mytool/mytool:latest
  command: ["mytool", "scan", "{target_url}", "--depth={config.depth}", "--out={output_dir}/report.json", "--rps={rate_limit}"]
  environment:
    MYTOOL_API_KEY: "env:MYTOOL_API_KEY"
  output_files: [report.json, urls.txt]
  output_format: issues
  defaults:
    depth: 2
base_confidence: 0.7
"#;

    fn plugin() -> ManifestPlugin {
        ManifestPlugin::new(PluginManifest::from_yaml(MANIFEST, "inline").unwrap())
    }

    #[test]
    fn configure_renders_templates() {
        let target = Target::new("shop", TargetType::Web, "https://shop.example.com");
        let policy = Policy::default().with_timebox(600);
        let mut plan = Plan::from_plugins(["recon"]);
        plan.plugins.push(PlanEntry::new("plugin.my-tool"));

        let spec = plugin().configure(&target, &policy, &plan).unwrap();
        assert_eq!(
            spec.command,
            vec![
                "mytool",
                "scan",
                "https://shop.example.com",
                "--depth=2",
                "--out={output_dir}/report.json",
                "--rps=5",
            ]
        );
        // resource timeout capped by the policy timebox
        assert_eq!(spec.timeout, Duration::from_secs(600));
        assert_eq!(spec.limits.memory_mb, 256);
        assert_eq!(spec.traffic, TrafficClass::Passive);
        assert_eq!(spec.target_host.as_deref(), Some("shop.example.com"));
        assert_eq!(spec.environment["MYTOOL_API_KEY"], "env:MYTOOL_API_KEY");
        assert_eq!(spec.output_files, vec!["report.json", "urls.txt"]);
    }

    #[test]
    fn plan_config_overrides_defaults() {
        let target = Target::new("shop", TargetType::Web, "https://shop.example.com");
        let mut plan = Plan::default();
        plan.plugin_config
            .insert("plugin.my-tool".into(), BTreeMap::from([("depth".to_string(), json!(5))]));
        let spec = plugin().configure(&target, &Policy::default(), &plan).unwrap();
        assert_eq!(spec.command[3], "--depth=5");
    }

    #[test]
    fn auth_env_vars_are_forwarded_by_reference() {
        let mut target = Target::new("shop", TargetType::Web, "https://shop.example.com");
        target.auth = Some(AuthDescriptor::Bearer {
            token_env: "SHOP_TOKEN".into(),
        });
        let spec = plugin().configure(&target, &Policy::default(), &Plan::default()).unwrap();
        assert_eq!(spec.environment["SHOP_TOKEN"], "env:SHOP_TOKEN");
    }

    #[test]
    fn missing_config_key_fails_configure() {
        let mut manifest = PluginManifest::from_yaml(MANIFEST, "inline").unwrap();
        manifest.execution.defaults.clear();
        let target = Target::new("shop", TargetType::Web, "https://shop.example.com");
        let err = ManifestPlugin::new(manifest)
            .configure(&target, &Policy::default(), &Plan::default())
            .unwrap_err();
        assert!(err.to_string().contains("depth"));
    }

    #[test]
    fn normalize_reads_the_declared_report() {
        let report = r#"{"issues":[{"title":"Open redirect","severity":"medium","url":"https://shop.example.com/r"}]}"#;
        let result = ExecutionResult::new(
            "plugin.my-tool",
            ExecutionStatus::Succeeded { exit_code: 0 },
            Duration::from_secs(3),
        )
        .with_artifact(Artifact::new("urls.txt", "https://shop.example.com/a\n"))
        .with_artifact(Artifact::new("report.json", report))
        .with_artifact(Artifact::new(STDOUT_ARTIFACT, "progress noise"));

        let output = plugin().normalize(&result);
        assert_eq!(output.findings.len(), 1);
        let finding = &output.findings[0];
        assert_eq!(finding.confidence, 0.7);
        assert_eq!(finding.tool.tool_name.as_deref(), Some("mytool"));
        assert_eq!(finding.evidence[0].artifact_ref.as_deref(), Some("artifact://report.json"));
    }

    #[test]
    fn url_only_plugins_produce_no_candidates() {
        let mut manifest = PluginManifest::from_yaml(MANIFEST, "inline").unwrap();
        manifest.execution.output_files = vec!["urls.txt".into()];
        let result = ExecutionResult::new(
            "plugin.my-tool",
            ExecutionStatus::Succeeded { exit_code: 0 },
            Duration::from_secs(1),
        )
        .with_artifact(Artifact::new(STDOUT_ARTIFACT, "https://shop.example.com/a\n"));
        let output = ManifestPlugin::new(manifest).normalize(&result);
        assert_eq!(output.candidates(), 0);
        assert!(output.warnings.is_empty());
    }

    #[test]
    fn reports_every_manifest_problem() {
        let mut manifest = PluginManifest::from_yaml(MANIFEST, "inline").unwrap();
        manifest.id = "Bad Id".into();
        manifest.version = "one".into();
        manifest.execution.command.clear();
        manifest.execution.output_files.push("../escape.json".into());
        manifest.base_confidence = 2.0;
        assert_eq!(manifest.problems().len(), 5);
        assert!(manifest.validate("inline").is_err());
    }

    #[test]
    fn tool_version_requirement() {
        let manifest = PluginManifest::from_yaml(MANIFEST, "inline").unwrap();
        assert!(manifest.accepts_tool_version("2.3.1"));
        assert!(!manifest.accepts_tool_version("1.9.0"));
    }
}
