//! Read-only access to audit logs

use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};

use super::{AuditEvent, AuditLevel};

/// Record filter for [`read_events`]
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Keep records at this level or above
    pub min_level: Option<AuditLevel>,
    pub event: Option<String>,
    pub run_id: Option<String>,
}

impl AuditFilter {
    pub fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(min) = self.min_level {
            if event.level < min {
                return false;
            }
        }
        if let Some(name) = &self.event {
            if &event.event != name {
                return false;
            }
        }
        if let Some(run_id) = &self.run_id {
            if &event.run_id != run_id {
                return false;
            }
        }
        true
    }
}

/// Read every record of a JSON-lines audit log that passes `filter`.
/// Malformed lines are reported and skipped.
pub fn read_events(path: &Path, filter: &AuditFilter) -> Result<Vec<AuditEvent>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open audit log: {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut out = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read audit log: {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditEvent>(&line) {
            Ok(event) if filter.matches(&event) => out.push(event),
            Ok(_) => {}
            Err(e) => tracing::warn!("Skipping malformed audit line {}: {}", idx + 1, e),
        }
    }
    Ok(out)
}
