//! Accepted-findings baseline for new-only gating

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::write_atomic;
use crate::domain::Finding;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub target_id: String,
    pub fingerprints: BTreeSet<String>,
}

impl Baseline {
    /// Baseline of every active finding of a run
    pub fn from_findings(run_id: &str, target_id: &str, findings: &[Finding]) -> Self {
        Self {
            created_at: Utc::now(),
            run_id: run_id.to_string(),
            target_id: target_id.to_string(),
            fingerprints: findings
                .iter()
                .filter(|f| !f.is_superseded())
                .filter_map(|f| f.fingerprint.clone())
                .collect(),
        }
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.fingerprints.contains(fingerprint)
    }

    pub fn is_known(&self, finding: &Finding) -> bool {
        finding
            .fingerprint
            .as_deref()
            .is_some_and(|fp| self.contains(fp))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read baseline: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse baseline: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_vec_pretty(self).context("Failed to serialize baseline")?;
        write_atomic(path, &content)
    }
}
