//! Bounded additive confidence model

use serde_json::json;

use super::history::HistoryEntry;
use super::verify::Reproduction;
use crate::domain::{Finding, TAG_INTERMITTENT, TriageConfig};
use crate::plugin::formats::RAW_OUTPUT_EVIDENCE;

/// Metadata key holding the adapter-assigned confidence before any adjustment
pub const BASE_CONFIDENCE_KEY: &str = "base_confidence";

/// Signals that move a finding's confidence away from its base
#[derive(Debug, Clone, Copy, Default)]
pub struct Signals<'a> {
    pub reproduction: Option<&'a Reproduction>,
    pub history: Option<&'a HistoryEntry>,
}

/// Per-adjustment breakdown, kept on the finding for the report
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Score {
    pub base: f64,
    pub reproduction: f64,
    pub evidence: f64,
    pub history: f64,
    pub flaky_history: f64,
    pub intermittent: f64,
}

impl Score {
    pub fn total(&self) -> f64 {
        let sum = self.base
            + self.reproduction
            + self.evidence
            + self.history
            + self.flaky_history
            + self.intermittent;
        sum.clamp(0.0, 1.0)
    }
}

/// Evidence beyond the raw tool output the adapter always attaches
fn has_rich_evidence(finding: &Finding) -> bool {
    finding
        .evidence
        .iter()
        .any(|e| e.evidence_type != RAW_OUTPUT_EVIDENCE)
}

/// Compute a finding's score from its base confidence and the run's signals
pub fn score(finding: &Finding, signals: Signals<'_>, config: &TriageConfig) -> Score {
    let weights = &config.weights;
    let base = finding
        .metadata
        .get(BASE_CONFIDENCE_KEY)
        .and_then(|v| v.as_f64())
        .unwrap_or(finding.confidence);

    let mut score = Score {
        base,
        ..Default::default()
    };

    if let Some(r) = signals.reproduction {
        if r.is_deterministic() {
            score.reproduction = weights.reproduction;
        } else if r.is_intermittent() {
            score.intermittent = weights.intermittent;
        }
    }
    if has_rich_evidence(finding) {
        score.evidence = weights.evidence;
    }
    if let Some(h) = signals.history {
        if h.seen_runs >= config.history_min_runs {
            score.history = weights.history;
        }
        if config.flaky_min_runs > 0 && h.flaky_runs >= config.flaky_min_runs {
            score.flaky_history = weights.flaky_history;
        }
    }
    score
}

/// Score a finding and write the result back.
///
/// The base confidence is stashed in metadata on first use so that scoring
/// an already-scored finding does not stack adjustments.
pub fn apply(finding: &mut Finding, signals: Signals<'_>, config: &TriageConfig) -> Score {
    let score = score(finding, signals, config);
    finding
        .metadata
        .entry(BASE_CONFIDENCE_KEY.to_string())
        .or_insert_with(|| json!(score.base));
    finding.confidence = score.total();
    if signals.reproduction.is_some_and(Reproduction::is_intermittent) {
        finding.add_tag(TAG_INTERMITTENT);
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Evidence, Family, Severity};

    fn finding(confidence: f64) -> Finding {
        Finding::new("zap", "XSS", Severity::High, Family::Security).with_confidence(confidence)
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn base_only_without_signals() {
        let f = finding(0.7).with_evidence(Evidence::artifact(RAW_OUTPUT_EVIDENCE, "zap/zap.sarif"));
        let s = score(&f, Signals::default(), &TriageConfig::default());
        assert!(close(s.total(), 0.7));
    }

    #[test]
    fn bonuses_and_penalties_add_up() {
        let config = TriageConfig::default();
        let f = finding(0.6).with_evidence(Evidence::inline("http", "GET / HTTP/1.1"));
        let deterministic = Reproduction { runs: vec![true, true] };
        let history = HistoryEntry {
            seen_runs: 3,
            flaky_runs: 0,
            ..Default::default()
        };
        let s = score(
            &f,
            Signals {
                reproduction: Some(&deterministic),
                history: Some(&history),
            },
            &config,
        );
        assert!(close(s.total(), 0.6 + 0.15 + 0.10 + 0.05));

        let intermittent = Reproduction { runs: vec![true, false] };
        let flaky = HistoryEntry {
            seen_runs: 1,
            flaky_runs: 2,
            ..Default::default()
        };
        let s = score(
            &finding(0.6),
            Signals {
                reproduction: Some(&intermittent),
                history: Some(&flaky),
            },
            &config,
        );
        assert!(close(s.total(), 0.1));
    }

    #[test]
    fn clamped_to_unit_interval() {
        let deterministic = Reproduction { runs: vec![true] };
        let signals = Signals {
            reproduction: Some(&deterministic),
            history: None,
        };
        let f = finding(0.95).with_evidence(Evidence::inline("http", "x"));
        assert!(close(score(&f, signals, &TriageConfig::default()).total(), 1.0));

        let flaky = HistoryEntry {
            flaky_runs: 5,
            ..Default::default()
        };
        let signals = Signals {
            reproduction: None,
            history: Some(&flaky),
        };
        assert!(close(score(&finding(0.1), signals, &TriageConfig::default()).total(), 0.0));
    }

    #[test]
    fn apply_tags_intermittent_and_does_not_stack() {
        let config = TriageConfig::default();
        let intermittent = Reproduction { runs: vec![false, true] };
        let signals = Signals {
            reproduction: Some(&intermittent),
            history: None,
        };
        let mut f = finding(0.8);
        apply(&mut f, signals, &config);
        assert!(close(f.confidence, 0.6));
        assert!(f.has_tag(TAG_INTERMITTENT));

        apply(&mut f, signals, &config);
        assert!(close(f.confidence, 0.6));
    }
}
