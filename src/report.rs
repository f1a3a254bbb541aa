//! Machine-readable run report (`report.json`)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::write_atomic;
use crate::dag::{NodeReport, NodeState};
use crate::domain::{ExitCode, Finding, GateResult, SeverityCounts, Target, TargetType};

pub const REPORT_SCHEMA_VERSION: &str = "1.0.0";
pub const REPORT_FILE: &str = "report.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSummary {
    pub id: String,
    #[serde(rename = "type")]
    pub target_type: TargetType,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl From<&Target> for TargetSummary {
    fn from(target: &Target) -> Self {
        Self {
            id: target.id.clone(),
            target_type: target.target_type,
            url: target.url.clone(),
            name: target.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    /// Active findings; superseded duplicates are listed but not counted
    pub total: u32,
    pub by_severity: SeverityCounts,
    pub by_family: BTreeMap<String, u32>,
    pub duration_seconds: f64,
    pub exit_code: i32,
    pub exit_reason: ExitCode,
    /// Why the run ended the way it did, when it was not a plain gate verdict
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_detail: Option<String>,
}

/// Per-plugin outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOutcome {
    pub plugin_id: String,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub duration_seconds: f64,
    #[serde(default)]
    pub findings: usize,
    #[serde(default)]
    pub dropped: usize,
}

impl NodeOutcome {
    pub fn from_report(report: &NodeReport) -> Self {
        let reason = match &report.state {
            NodeState::Failed { reason } | NodeState::Skipped { reason } => Some(reason.clone()),
            _ => None,
        };
        Self {
            plugin_id: report.id.clone(),
            state: report.state.as_str().to_string(),
            reason,
            exit_code: report.result.as_ref().and_then(|r| r.status.exit_code()),
            duration_seconds: report.duration.as_secs_f64(),
            findings: 0,
            dropped: 0,
        }
    }

    /// A plugin filtered out before the plan was compiled
    pub fn skipped(plugin_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            state: "skipped".to_string(),
            reason: Some(reason.into()),
            exit_code: None,
            duration_seconds: 0.0,
            findings: 0,
            dropped: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub plugins_run: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attack_session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_log: Option<String>,
    pub kernel_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub schema_version: String,
    pub run_id: String,
    pub target: TargetSummary,
    pub summary: Summary,
    /// Absent only when the run was blocked before any plugin could run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateResult>,
    pub findings: Vec<Finding>,
    pub nodes: Vec<NodeOutcome>,
    pub metadata: ReportMetadata,
}

impl Report {
    pub fn new(run_id: impl Into<String>, target: &Target, started_at: DateTime<Utc>) -> Self {
        Self {
            schema_version: REPORT_SCHEMA_VERSION.to_string(),
            run_id: run_id.into(),
            target: TargetSummary::from(target),
            summary: Summary {
                total: 0,
                by_severity: SeverityCounts::default(),
                by_family: BTreeMap::new(),
                duration_seconds: 0.0,
                exit_code: ExitCode::Pass.code(),
                exit_reason: ExitCode::Pass,
                exit_detail: None,
            },
            gate: None,
            findings: Vec::new(),
            nodes: Vec::new(),
            metadata: ReportMetadata {
                started_at,
                completed_at: started_at,
                plugins_run: Vec::new(),
                mode: None,
                attack_session: None,
                audit_log: None,
                kernel_version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }

    pub fn with_findings(mut self, findings: Vec<Finding>) -> Self {
        self.findings = findings;
        self
    }

    pub fn with_gate(mut self, gate: GateResult) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_nodes(mut self, nodes: Vec<NodeOutcome>) -> Self {
        self.nodes = nodes;
        self
    }

    /// Stamp the final classification and recompute the summary
    pub fn finish(&mut self, exit: ExitCode, detail: Option<String>, completed_at: DateTime<Utc>) {
        let mut by_severity = SeverityCounts::default();
        let mut by_family: BTreeMap<String, u32> = BTreeMap::new();
        for finding in self.findings.iter().filter(|f| !f.is_superseded()) {
            by_severity.increment(finding.severity);
            *by_family.entry(finding.family.as_str().to_string()).or_default() += 1;
        }

        let elapsed = completed_at - self.metadata.started_at;
        self.summary = Summary {
            total: by_severity.total(),
            by_severity,
            by_family,
            duration_seconds: elapsed.num_milliseconds().max(0) as f64 / 1000.0,
            exit_code: exit.code(),
            exit_reason: exit,
            exit_detail: detail,
        };
        if let Some(gate) = self.gate.as_mut() {
            gate.exit_code = exit.code();
            gate.exit_reason = exit;
        }
        self.metadata.completed_at = completed_at;
        self.metadata.plugins_run = self
            .nodes
            .iter()
            .filter(|n| n.state != "skipped")
            .map(|n| n.plugin_id.clone())
            .collect();
    }

    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(REPORT_FILE)
    }

    /// Write `report.json` into `dir` atomically
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        let path = Self::path_in(dir);
        let content = serde_json::to_vec_pretty(self).context("Failed to serialize report")?;
        write_atomic(&path, &content)?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read report: {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse report: {}", path.display()))
    }
}
