//! Per-target finding history.
//!
//! `<output_dir>/<target_id>/history.json` remembers, per fingerprint, how
//! many runs reported it and how many of those saw it reproduce
//! inconsistently. Confidence scoring reads it; every completed run updates it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::write_atomic;
use crate::domain::{Finding, TAG_INTERMITTENT};

pub const HISTORY_FILE: &str = "history.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub seen_runs: u32,
    pub flaky_runs: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_seen: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    #[serde(default)]
    pub target_id: String,
    /// Completed runs folded into this history
    #[serde(default)]
    pub runs: u32,
    #[serde(default)]
    pub fingerprints: BTreeMap<String, HistoryEntry>,
}

impl History {
    pub fn new(target_id: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            ..Default::default()
        }
    }

    pub fn path_for(output_dir: &Path, target_id: &str) -> PathBuf {
        output_dir.join(target_id).join(HISTORY_FILE)
    }

    /// Load a history file; a missing file is an empty history
    pub fn load(path: &Path, target_id: &str) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new(target_id));
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read history file: {}", path.display()))?;
        let mut history: History = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse history file: {}", path.display()))?;
        if history.target_id.is_empty() {
            history.target_id = target_id.to_string();
        }
        Ok(history)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_vec_pretty(self).context("Failed to serialize history")?;
        write_atomic(path, &content)
    }

    pub fn get(&self, fingerprint: &str) -> Option<&HistoryEntry> {
        self.fingerprints.get(fingerprint)
    }

    /// Fold one run's active findings into the history
    pub fn record_run(&mut self, findings: &[Finding]) {
        let now = Utc::now();
        self.runs += 1;
        let mut counted: Vec<&str> = Vec::new();
        for finding in findings.iter().filter(|f| !f.is_superseded()) {
            let Some(fp) = finding.fingerprint.as_deref() else {
                continue;
            };
            if counted.contains(&fp) {
                continue;
            }
            counted.push(fp);

            let entry = self.fingerprints.entry(fp.to_string()).or_default();
            entry.seen_runs += 1;
            if finding.has_tag(TAG_INTERMITTENT) {
                entry.flaky_runs += 1;
            }
            entry.first_seen.get_or_insert(now);
            entry.last_seen = Some(now);
        }
    }
}
