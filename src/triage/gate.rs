//! Quality gate evaluation

use super::Baseline;
use crate::domain::{ExitCode, Finding, GateResult, Policy, Severity, SeverityCounts};

/// Whether a finding counts against the gate
pub fn counts_toward_gate(finding: &Finding, policy: &Policy, baseline: Option<&Baseline>) -> bool {
    if finding.is_superseded() || finding.confidence < policy.gate_confidence() {
        return false;
    }
    match baseline {
        Some(b) if policy.new_findings_only => !b.is_known(finding),
        _ => true,
    }
}

/// Evaluate the gate over a triaged finding set.
///
/// Pure: the same findings, policy and baseline always give the same result.
pub fn evaluate_gate(findings: &[Finding], policy: &Policy, baseline: Option<&Baseline>) -> GateResult {
    let mut actual = SeverityCounts::default();
    for finding in findings.iter().filter(|f| counts_toward_gate(f, policy, baseline)) {
        actual.increment(finding.severity);
    }

    let violations: Vec<String> = Severity::ALL
        .iter()
        .filter_map(|severity| {
            let threshold = policy.gate.get(*severity)?;
            let count = actual.get(*severity);
            (count > threshold).then(|| {
                format!(
                    "{}: {} findings exceed threshold of {}",
                    severity.as_str().to_uppercase(),
                    count,
                    threshold
                )
            })
        })
        .collect();

    let passed = violations.is_empty();
    let exit_reason = if passed { ExitCode::Pass } else { ExitCode::GateFail };
    GateResult {
        passed,
        thresholds: policy.gate.clone(),
        actual,
        violations,
        exit_code: exit_reason.code(),
        exit_reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Family, GateThresholds};

    fn findings(severity: Severity, n: usize, confidence: f64) -> Vec<Finding> {
        (0..n)
            .map(|i| {
                let mut f = Finding::new("zap", format!("Issue {}", i), severity, Family::Security)
                    .with_confidence(confidence);
                f.fingerprint = Some(format!("fp_{}_{}", severity, i));
                f
            })
            .collect()
    }

    fn policy(gate: &str) -> Policy {
        Policy::default().with_gate(GateThresholds::parse(gate).unwrap())
    }

    #[test]
    fn reports_itemized_violations() {
        let mut set = findings(Severity::High, 5, 0.9);
        set.extend(findings(Severity::Critical, 1, 0.9));
        let result = evaluate_gate(&set, &policy("critical=0,high=3"), None);

        assert!(!result.passed);
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.exit_reason, ExitCode::GateFail);
        assert_eq!(
            result.violations,
            vec![
                "CRITICAL: 1 findings exceed threshold of 0",
                "HIGH: 5 findings exceed threshold of 3",
            ]
        );
    }

    #[test]
    fn counts_at_threshold_pass() {
        let set = findings(Severity::High, 3, 0.9);
        let result = evaluate_gate(&set, &policy("high=3"), None);
        assert!(result.passed);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.actual.high, 3);
    }

    #[test]
    fn low_confidence_and_superseded_do_not_count() {
        let mut set = findings(Severity::High, 2, 0.9);
        set.extend(findings(Severity::High, 4, 0.2));
        set[1].superseded_by = Some(set[0].finding_id.clone());
        let result = evaluate_gate(&set, &policy("high=1"), None);
        assert!(result.passed);
        assert_eq!(result.actual.high, 1);

        let mut strict = policy("high=1");
        strict.min_confidence = Some(0.1);
        assert!(!evaluate_gate(&set, &strict, None).passed);
    }

    #[test]
    fn new_only_excludes_baseline() {
        let set = findings(Severity::Critical, 2, 0.9);
        let baseline = Baseline::from_findings("run_old", "shop", &set[..1]);
        let mut p = policy("critical=0");
        assert!(!evaluate_gate(&set, &p, Some(&baseline)).passed);

        p.new_findings_only = true;
        let result = evaluate_gate(&set, &p, Some(&baseline));
        assert_eq!(result.actual.critical, 1);
        assert!(!result.passed);
        assert!(evaluate_gate(&set[..1], &p, Some(&baseline)).passed);
    }

    #[test]
    fn no_thresholds_always_pass() {
        let set = findings(Severity::Critical, 10, 1.0);
        assert!(evaluate_gate(&set, &Policy::default().with_gate(GateThresholds::default()), None).passed);
    }
}
