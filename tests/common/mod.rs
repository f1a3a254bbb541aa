//! Shared fixtures for kernel integration tests: a scripted sandbox, static
//! proof sources and manifest-backed test plugins.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::TempDir;

use testuniverse::audit::{AuditEvent, AuditFilter, read_events};
use testuniverse::config::Settings;
use testuniverse::governance::{Admission, ProofSource, WellKnownDocument};
use testuniverse::kernel::ReachabilityProbe;
use testuniverse::plugin::{ManifestPlugin, PluginManifest, PluginRegistry};
use testuniverse::sandbox::{JobContext, SandboxRunner};
use testuniverse::{
    Artifact, AuthorizationProof, ExecutionResult, ExecutionSpec, ExecutionStatus, Kernel,
    STDOUT_ARTIFACT, Target, TargetType,
};

/// Telemetry file every test plugin declares
pub const STATUS_LOG: &str = "status.log";

/// What the scripted runner does for one plugin
#[derive(Debug, Clone)]
pub struct Script {
    pub stdout: String,
    pub delay: Duration,
    pub exit_code: i32,
    /// Contents of the plugin's status log
    pub telemetry: Option<String>,
}

impl Script {
    pub fn findings(records: Vec<Value>) -> Self {
        Self {
            stdout: Value::Array(records).to_string(),
            delay: Duration::from_secs(1),
            exit_code: 0,
            telemetry: None,
        }
    }

    pub fn taking(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn exiting(mut self, exit_code: i32) -> Self {
        self.exit_code = exit_code;
        self
    }

    /// Report HTTP statuses seen against the target, one per line
    pub fn observing(mut self, statuses: &str) -> Self {
        self.telemetry = Some(statuses.to_string());
        self
    }
}

/// Sandbox stand-in that replays scripted output and records every launch
#[derive(Default)]
pub struct FakeRunner {
    scripts: HashMap<String, Script>,
    calls: Mutex<Vec<String>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, plugin_id: &str, script: Script) -> Self {
        self.scripts.insert(plugin_id.to_string(), script);
        self
    }

    /// Job ids in launch order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxRunner for FakeRunner {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn execute(&self, _admission: &Admission, spec: &ExecutionSpec, ctx: &JobContext) -> ExecutionResult {
        self.calls.lock().unwrap().push(ctx.job_id.clone());
        let script = self
            .scripts
            .get(&spec.plugin_id)
            .cloned()
            .unwrap_or_else(|| Script::findings(Vec::new()));

        tokio::select! {
            _ = tokio::time::sleep(script.delay) => {
                let mut result =
                    ExecutionResult::new(&spec.plugin_id, spec.classify_exit(script.exit_code), script.delay)
                        .with_artifact(Artifact::new(STDOUT_ARTIFACT, script.stdout.into_bytes()));
                if let Some(statuses) = script.telemetry {
                    result = result.with_artifact(Artifact::new(STATUS_LOG, statuses.into_bytes()));
                }
                result
            }
            _ = ctx.cancel.cancelled() => {
                ExecutionResult::new(&spec.plugin_id, ExecutionStatus::Cancelled, Duration::ZERO)
            }
        }
    }
}

/// Proof source with no network behind it
#[derive(Default)]
pub struct StaticProofs {
    pub env: HashMap<String, String>,
}

#[async_trait]
impl ProofSource for StaticProofs {
    async fn dns_txt(&self, _name: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn well_known(&self, _base_url: &str) -> Result<Option<WellKnownDocument>> {
        Ok(None)
    }

    fn env_var(&self, name: &str) -> Option<String> {
        self.env.get(name).cloned()
    }
}

/// Reachability probe answering with a fixed status, or failing to connect
pub struct FakeProbe {
    pub status: Option<u16>,
}

#[async_trait]
impl ReachabilityProbe for FakeProbe {
    async fn probe(&self, url: &str) -> Result<u16> {
        match self.status {
            Some(status) => Ok(status),
            None => anyhow::bail!("Failed to connect to {}", url),
        }
    }
}

/// Passive web plugin reading native findings from stdout
pub fn test_plugin(id: &str, families: &[&str]) -> ManifestPlugin {
    let yaml = format!(
        r#"
id: {id}
name: {id}
version: 1.0.0
tool:
  name: {id}
capabilities:
  target_types: [web, api]
  families: [{families}]
execution:
  command: ["{id}", "{{target_url}}"]
  output_format: native
  telemetry_file: status.log
"#,
        families = families.join(", ")
    );
    ManifestPlugin::new(PluginManifest::from_yaml(&yaml, "test").unwrap())
}

pub fn registry(plugins: &[(&str, &[&str])]) -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    for (id, families) in plugins {
        registry.register(Arc::new(test_plugin(id, families)));
    }
    registry
}

pub fn finding(plugin: &str, title: &str, severity: &str, url: &str) -> Value {
    json!({
        "title": title,
        "severity": severity,
        "confidence": 0.9,
        "family": "security",
        "category": "injection",
        "tool": {"plugin_id": plugin},
        "location": {"url": url, "parameter": "q"},
    })
}

pub fn authorized_target() -> Target {
    Target::new("shop", TargetType::Web, "https://shop.example").with_authorization(
        AuthorizationProof::OwnerProof {
            proof: "signed-by-owner".to_string(),
            expires: None,
        },
    )
}

pub fn settings(output: &Path) -> Settings {
    Settings {
        output_dir: output.to_path_buf(),
        ..Default::default()
    }
}

/// Kernel with scripted runner, static proofs and a healthy target
pub fn kernel(output: &TempDir, registry: PluginRegistry, runner: Arc<FakeRunner>) -> Kernel {
    Kernel::new(settings(output.path()), registry)
        .unwrap()
        .with_runner(runner)
        .with_proof_source(Arc::new(StaticProofs::default()))
        .with_probe(Arc::new(FakeProbe { status: Some(200) }))
}

pub fn audit_events(path: &Path) -> Vec<AuditEvent> {
    read_events(path, &AuditFilter::default()).unwrap()
}
