//! Sandbox job descriptors and their results

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Kind of traffic a job sends to the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficClass {
    /// No traffic to the target (static analysis, local tools)
    None,
    /// Read-only, non-intrusive requests
    #[default]
    Passive,
    /// Intrusive traffic, only allowed inside an Attack Mode session
    Active,
}

impl TrafficClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficClass::None => "none",
            TrafficClass::Passive => "passive",
            TrafficClass::Active => "active",
        }
    }

    pub fn touches_target(&self) -> bool {
        !matches!(self, TrafficClass::None)
    }
}

/// Resource limits for one sandboxed job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self { memory_mb: 512 }
    }
}

/// Per-job sandbox descriptor produced by a plugin's `configure()`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSpec {
    pub plugin_id: String,
    /// Container image, used by the container backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub command: Vec<String>,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub limits: ResourceLimits,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Files the job is expected to write into its output directory
    #[serde(default)]
    pub output_files: Vec<String>,
    pub traffic: TrafficClass,
    /// Output file listing observed HTTP status codes, one per line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry_file: Option<String>,
    /// Exit codes the tool uses to say it could not reach the target
    #[serde(default)]
    pub unreachable_exit_codes: Vec<i32>,
    /// Exit codes counted as success (tools often exit non-zero when they find issues)
    #[serde(default = "default_success_codes")]
    pub success_exit_codes: Vec<i32>,
    /// Host the job talks to, used for rate limiting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_host: Option<String>,
}

fn default_success_codes() -> Vec<i32> {
    vec![0]
}

impl ExecutionSpec {
    pub fn new(plugin_id: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            image: None,
            command,
            timeout: Duration::from_secs(300),
            limits: ResourceLimits::default(),
            environment: BTreeMap::new(),
            output_files: Vec::new(),
            traffic: TrafficClass::Passive,
            telemetry_file: None,
            unreachable_exit_codes: Vec::new(),
            success_exit_codes: default_success_codes(),
            target_host: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.limits.memory_mb = memory_mb;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_output_file(mut self, name: impl Into<String>) -> Self {
        self.output_files.push(name.into());
        self
    }

    pub fn with_traffic(mut self, traffic: TrafficClass) -> Self {
        self.traffic = traffic;
        self
    }

    /// Classify a process exit code for this job
    pub fn classify_exit(&self, exit_code: i32) -> ExecutionStatus {
        if self.success_exit_codes.contains(&exit_code) {
            ExecutionStatus::Succeeded { exit_code }
        } else if self.unreachable_exit_codes.contains(&exit_code) {
            ExecutionStatus::Unreachable { exit_code }
        } else {
            ExecutionStatus::Failed { exit_code }
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Terminal state of one sandboxed job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Succeeded { exit_code: i32 },
    Failed { exit_code: i32 },
    /// The tool reported it could not connect to the target
    Unreachable { exit_code: i32 },
    TimedOut,
    Cancelled,
    LaunchFailed { reason: String },
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Succeeded { .. } => "SUCCEEDED",
            ExecutionStatus::Failed { .. } => "FAILED",
            ExecutionStatus::Unreachable { .. } => "UNREACHABLE",
            ExecutionStatus::TimedOut => "TIMED_OUT",
            ExecutionStatus::Cancelled => "CANCELLED",
            ExecutionStatus::LaunchFailed { .. } => "LAUNCH_FAILED",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionStatus::Succeeded { .. })
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExecutionStatus::Succeeded { exit_code }
            | ExecutionStatus::Failed { exit_code }
            | ExecutionStatus::Unreachable { exit_code } => Some(*exit_code),
            _ => None,
        }
    }
}

/// A captured output of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub bytes: Vec<u8>,
    /// Where the artifact was persisted, if anywhere
    pub path: Option<PathBuf>,
}

impl Artifact {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
            path: None,
        }
    }

    pub fn with_path(mut self, path: PathBuf) -> Self {
        self.path = Some(path);
        self
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    /// Reference used in evidence records
    pub fn reference(&self) -> String {
        match &self.path {
            Some(p) => p.display().to_string(),
            None => format!("artifact://{}", self.name),
        }
    }
}

pub const STDOUT_ARTIFACT: &str = "stdout";
pub const STDERR_ARTIFACT: &str = "stderr";

/// Result of one sandboxed job
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub plugin_id: String,
    pub status: ExecutionStatus,
    pub duration: Duration,
    pub artifacts: BTreeMap<String, Artifact>,
}

impl ExecutionResult {
    pub fn new(plugin_id: impl Into<String>, status: ExecutionStatus, duration: Duration) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            status,
            duration,
            artifacts: BTreeMap::new(),
        }
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.insert(artifact.name.clone(), artifact);
        self
    }

    pub fn artifact(&self, name: &str) -> Option<&Artifact> {
        self.artifacts.get(name)
    }

    pub fn stdout(&self) -> String {
        self.artifact(STDOUT_ARTIFACT)
            .map(Artifact::text)
            .unwrap_or_default()
    }

    pub fn stderr(&self) -> String {
        self.artifact(STDERR_ARTIFACT)
            .map(Artifact::text)
            .unwrap_or_default()
    }
}
