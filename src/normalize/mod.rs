//! Normalization pipeline
//!
//! Plugin adapters turn raw tool output into candidate findings; this module
//! enforces the output contract on them. Every candidate is stamped with the
//! run identity, validated against the universal schema and redacted before
//! it is accepted. Invalid candidates are dropped and audited, never coerced.

mod redact;
mod schema;

use serde_json::json;

use crate::audit::{AuditLog, events};
use crate::domain::{Finding, new_finding_id};

pub use redact::{REDACTION_MARKER, redact_finding, redact_json, redact_str};
pub use schema::{MAX_TITLE_LEN, SchemaViolation, parse_candidate, parse_finding, validate_finding};

/// Candidate findings produced by one plugin adapter
#[derive(Debug, Default)]
pub struct PluginOutput {
    pub findings: Vec<Finding>,
    /// Candidates the adapter could not even build a Finding from
    pub rejected: Vec<SchemaViolation>,
    pub warnings: Vec<String>,
}

impl PluginOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn candidates(&self) -> usize {
        self.findings.len() + self.rejected.len()
    }
}

/// Accepted findings of one plugin plus bookkeeping for failure classification
#[derive(Debug, Default)]
pub struct Normalized {
    pub findings: Vec<Finding>,
    pub dropped: usize,
    pub redactions: usize,
}

/// Enforces the Finding contract for one run
pub struct Normalizer<'a> {
    run_id: &'a str,
    target_id: &'a str,
    audit: &'a AuditLog,
}

impl<'a> Normalizer<'a> {
    pub fn new(run_id: &'a str, target_id: &'a str, audit: &'a AuditLog) -> Self {
        Self {
            run_id,
            target_id,
            audit,
        }
    }

    /// Validate, redact and accept a plugin's candidates
    pub fn accept(&self, plugin_id: &str, output: PluginOutput) -> Normalized {
        let mut normalized = Normalized::default();

        for warning in &output.warnings {
            tracing::debug!("{}: {}", plugin_id, warning);
        }

        for violation in output.rejected {
            self.drop_candidate(plugin_id, None, &violation);
            normalized.dropped += 1;
        }

        for mut finding in output.findings {
            finding.run_id = self.run_id.to_string();
            finding.target_id = self.target_id.to_string();
            if finding.finding_id.is_empty() {
                finding.finding_id = new_finding_id();
            }
            if finding.sources.is_empty() {
                finding.sources.push((&finding.tool).into());
            }

            if let Err(violation) = validate_finding(&finding) {
                self.drop_candidate(plugin_id, Some(&finding), &violation);
                normalized.dropped += 1;
                continue;
            }

            normalized.redactions += redact_finding(&mut finding);
            normalized.findings.push(finding);
        }

        self.audit.info(
            events::FINDINGS_NORMALIZED,
            json!({
                "plugin": plugin_id,
                "accepted": normalized.findings.len(),
                "dropped": normalized.dropped,
                "redactions": normalized.redactions,
            }),
        );
        normalized
    }

    fn drop_candidate(&self, plugin_id: &str, finding: Option<&Finding>, violation: &SchemaViolation) {
        // Dropped titles are audited redacted, same as accepted findings
        let title = finding.map(|f| redact_str(&f.title).0);
        self.audit.warn(
            events::FINDING_DROPPED,
            json!({
                "plugin": plugin_id,
                "reason": violation.code(),
                "detail": violation.to_string(),
                "title": title,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Evidence, Family, Severity};

    #[test]
    fn stamps_validates_and_redacts() {
        let audit = AuditLog::in_memory("run_abc123");
        let normalizer = Normalizer::new("run_abc123", "my-webapp", &audit);

        let good = Finding::new("zap", "Token in response", Severity::High, Family::Security)
            .with_confidence(0.8)
            .with_evidence(Evidence::inline("log", "api_key=abcd1234efgh5678"));
        let bad = Finding::new("zap", "Overconfident", Severity::Low, Family::Security)
            .with_confidence(1.7);

        let mut output = PluginOutput::new();
        output.findings = vec![good, bad];
        output.rejected.push(SchemaViolation::MissingField("title"));

        let normalized = normalizer.accept("zap", output);
        assert_eq!(normalized.findings.len(), 1);
        assert_eq!(normalized.dropped, 2);
        assert!(normalized.redactions >= 1);

        let accepted = &normalized.findings[0];
        assert_eq!(accepted.run_id, "run_abc123");
        assert_eq!(accepted.target_id, "my-webapp");
        assert_eq!(
            accepted.evidence[0].content.as_ref().unwrap(),
            &serde_json::json!("api_key=[REDACTED]")
        );

        assert_eq!(audit.count(events::FINDING_DROPPED), 2);
        let dropped = audit.events_named(events::FINDING_DROPPED);
        assert_eq!(dropped[1].field_str("reason"), Some("confidence_out_of_range"));
    }
}
