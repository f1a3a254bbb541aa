//! Triage engine
//!
//! Consumes the full normalized finding set of a run and turns it into the
//! reported set plus a gate decision:
//!
//! 1. every finding gets a stable [`fingerprint`]
//! 2. confidence is rescored from reproduction, evidence and history signals
//! 3. duplicates across tools are merged ([`dedupe`]), never deleted
//! 4. findings below the policy's severity threshold leave the report
//! 5. the quality gate is evaluated ([`evaluate_gate`])
//!
//! History and baselines are loaded and saved by the caller; the engine
//! only reads them.

mod baseline;
mod confidence;
mod dedupe;
mod fingerprint;
mod gate;
mod history;
mod verify;

use serde_json::json;

use crate::audit::{AuditLog, events};
use crate::domain::{Finding, GateResult, Policy};

pub use baseline::Baseline;
pub use confidence::{BASE_CONFIDENCE_KEY, Score, Signals, apply as apply_confidence, score};
pub use dedupe::{MERGED_SEVERITIES, Merge, dedupe};
pub use fingerprint::{fingerprint, normalize_title, normalize_url};
pub use gate::{counts_toward_gate, evaluate_gate};
pub use history::{HISTORY_FILE, History, HistoryEntry};
pub use verify::{Reproduction, Verification};

/// Result of triaging one run
#[derive(Debug, Clone)]
pub struct Triaged {
    /// Reported findings, superseded duplicates included
    pub findings: Vec<Finding>,
    pub merges: Vec<Merge>,
    /// Findings removed for falling below the severity threshold
    pub below_threshold: usize,
    pub gate: GateResult,
}

impl Triaged {
    pub fn active(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| !f.is_superseded())
    }
}

pub struct TriageEngine<'a> {
    policy: &'a Policy,
    audit: &'a AuditLog,
}

impl<'a> TriageEngine<'a> {
    pub fn new(policy: &'a Policy, audit: &'a AuditLog) -> Self {
        Self { policy, audit }
    }

    pub fn run(
        &self,
        mut findings: Vec<Finding>,
        verification: &Verification,
        history: Option<&History>,
        baseline: Option<&Baseline>,
    ) -> Triaged {
        let config = &self.policy.triage;

        for finding in findings.iter_mut() {
            let fp = finding.fingerprint.clone().unwrap_or_else(|| fingerprint(finding));
            let signals = Signals {
                reproduction: verification.get(&fp),
                history: history.and_then(|h| h.get(&fp)),
            };
            apply_confidence(finding, signals, config);
            finding.fingerprint = Some(fp);
        }

        let merges = dedupe(&mut findings, config.similarity_threshold);
        for merge in &merges {
            self.audit.info(
                events::FINDINGS_MERGED,
                json!({"kept": merge.kept, "superseded": merge.superseded}),
            );
        }

        let before = findings.len();
        let floor = self.policy.severity_threshold;
        findings.retain(|f| f.severity.at_least(floor));
        let below_threshold = before - findings.len();
        if below_threshold > 0 {
            tracing::debug!(
                "{} findings below severity threshold {} left out of the report",
                below_threshold,
                floor
            );
        }

        let gate = evaluate_gate(&findings, self.policy, baseline);
        let payload = json!({
            "passed": gate.passed,
            "violations": gate.violations,
            "actual": gate.actual,
            "thresholds": gate.thresholds,
            "new_only": self.policy.new_findings_only && baseline.is_some(),
        });
        if gate.passed {
            self.audit.info(events::GATE_EVALUATED, payload);
        } else {
            self.audit.warn(events::GATE_EVALUATED, payload);
        }

        Triaged {
            findings,
            merges,
            below_threshold,
            gate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Evidence, Family, GateThresholds, Severity, TAG_INTERMITTENT};

    fn finding(plugin: &str, title: &str, severity: Severity, confidence: f64) -> Finding {
        Finding::new(plugin, title, severity, Family::Security)
            .with_category("injection")
            .with_url("https://shop.example/search")
            .with_parameter("q")
            .with_confidence(confidence)
    }

    #[test]
    fn merges_scores_and_gates() {
        let policy = Policy::default().with_gate(GateThresholds::parse("high=0").unwrap());
        let audit = AuditLog::in_memory("run_t1");
        let engine = TriageEngine::new(&policy, &audit);

        let findings = vec![
            finding("zap-baseline", "SQL Injection", Severity::High, 0.7),
            finding("nuclei", "SQL injection", Severity::High, 0.65)
                .with_evidence(Evidence::inline("http", "GET /search?q=' HTTP/1.1")),
        ];
        let triaged = engine.run(findings, &Verification::new(), None, None);

        assert_eq!(triaged.merges.len(), 1);
        assert_eq!(triaged.findings.len(), 2);
        let active: Vec<&Finding> = triaged.active().collect();
        assert_eq!(active.len(), 1);
        // 0.65 plus the evidence bonus beats 0.7
        assert_eq!(active[0].tool.plugin_id, "nuclei");
        assert_eq!(active[0].sources.len(), 2);
        assert!(!triaged.gate.passed);
        assert_eq!(triaged.gate.actual.high, 1);
        assert_eq!(audit.count(events::FINDINGS_MERGED), 1);
        assert_eq!(audit.count(events::GATE_EVALUATED), 1);
    }

    #[test]
    fn severity_threshold_trims_report() {
        let policy = Policy {
            severity_threshold: Severity::Medium,
            ..Default::default()
        };
        let audit = AuditLog::in_memory("run_t2");
        let findings = vec![
            finding("zap", "Cookie without SameSite", Severity::Low, 0.9),
            finding("zap", "Open redirect", Severity::Medium, 0.9).with_parameter("next"),
        ];
        let triaged = TriageEngine::new(&policy, &audit).run(findings, &Verification::new(), None, None);
        assert_eq!(triaged.below_threshold, 1);
        assert_eq!(triaged.findings.len(), 1);
        assert!(triaged.gate.passed);
    }

    #[test]
    fn intermittent_findings_drop_below_gate_confidence() {
        let policy = Policy::default().with_gate(GateThresholds::parse("critical=0").unwrap());
        let audit = AuditLog::in_memory("run_t3");
        let original = vec![finding("zap", "Remote code execution", Severity::Critical, 0.6)];
        let mut verification = Verification::new();
        verification.record_rerun(&original, &[]);
        verification.record_rerun(&original, &original);

        let triaged = TriageEngine::new(&policy, &audit).run(original, &verification, None, None);
        let f = &triaged.findings[0];
        assert!(f.has_tag(TAG_INTERMITTENT));
        assert!(f.confidence < policy.gate_confidence());
        assert!(triaged.gate.passed);
    }

    #[test]
    fn triage_twice_is_stable() {
        let policy = Policy::default();
        let audit = AuditLog::in_memory("run_t4");
        let engine = TriageEngine::new(&policy, &audit);
        let findings = vec![
            finding("zap", "SQL Injection", Severity::High, 0.7),
            finding("nuclei", "SQL Injection", Severity::High, 0.8),
            finding("zap", "Stack trace disclosure", Severity::Low, 0.5).with_parameter("debug"),
        ];
        let first = engine.run(findings, &Verification::new(), None, None);
        let second = engine.run(first.findings.clone(), &Verification::new(), None, None);
        assert!(second.merges.is_empty());
        assert_eq!(second.findings, first.findings);
    }
}
