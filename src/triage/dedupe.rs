//! Duplicate detection across tools
//!
//! Two active findings describe the same issue when their normalized
//! location, parameter and category match and their titles are similar
//! enough by Jaro-Winkler. The higher-confidence finding survives; the
//! other is marked `superseded_by` and its provenance moves into the
//! survivor's `sources`. The survivor keeps its own severity and tags.
//! Nothing is removed from the set.

use strsim::jaro_winkler;

use super::fingerprint::{location_key, normalize_title, parameter_key};
use crate::domain::Finding;

/// Metadata key listing every severity reported within a merged group
pub const MERGED_SEVERITIES: &str = "merged_severities";

/// One merge: `superseded` was folded into `kept`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Merge {
    pub kept: String,
    pub superseded: String,
}

fn same_issue(a: &Finding, b: &Finding, threshold: f64) -> bool {
    a.category.trim().eq_ignore_ascii_case(b.category.trim())
        && location_key(a) == location_key(b)
        && parameter_key(a) == parameter_key(b)
        && jaro_winkler(&normalize_title(&a.title), &normalize_title(&b.title)) >= threshold
}

/// Fold `from` into `into`. Only provenance moves; the severities seen
/// across the group are recorded under `merged_severities`.
fn absorb(into: &mut Finding, from: &Finding) {
    for source in &from.sources {
        into.add_source(source.clone());
    }

    let mut seen: Vec<String> = match into.metadata.get(MERGED_SEVERITIES) {
        Some(serde_json::Value::Array(values)) => {
            values.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()
        }
        _ => vec![into.severity.as_str().to_string()],
    };
    let carried = match from.metadata.get(MERGED_SEVERITIES) {
        Some(serde_json::Value::Array(values)) => {
            values.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()
        }
        _ => vec![from.severity.as_str().to_string()],
    };
    for severity in carried {
        if !seen.contains(&severity) {
            seen.push(severity);
        }
    }
    into.metadata.insert(MERGED_SEVERITIES.to_string(), serde_json::json!(seen));
}

/// Merge duplicates in place until no two active findings match.
///
/// Running it again on its own output performs no merges.
pub fn dedupe(findings: &mut [Finding], threshold: f64) -> Vec<Merge> {
    let mut merges = Vec::new();

    loop {
        let mut merged_any = false;
        for i in 0..findings.len() {
            if findings[i].is_superseded() {
                continue;
            }
            for j in (i + 1)..findings.len() {
                if findings[j].is_superseded() || !same_issue(&findings[i], &findings[j], threshold) {
                    continue;
                }
                // Ties keep the earlier finding
                let (keep, lose) = if findings[j].confidence > findings[i].confidence {
                    (j, i)
                } else {
                    (i, j)
                };
                let loser = findings[lose].clone();
                absorb(&mut findings[keep], &loser);

                let kept_id = findings[keep].finding_id.clone();
                for f in findings.iter_mut() {
                    if f.superseded_by.as_deref() == Some(loser.finding_id.as_str()) {
                        f.superseded_by = Some(kept_id.clone());
                    }
                }
                findings[lose].superseded_by = Some(kept_id.clone());

                merges.push(Merge {
                    kept: kept_id,
                    superseded: loser.finding_id,
                });
                merged_any = true;
                if lose == i {
                    break;
                }
            }
        }
        if !merged_any {
            break;
        }
    }
    merges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Family, Severity};

    fn sqli(plugin: &str, title: &str, confidence: f64) -> Finding {
        Finding::new(plugin, title, Severity::High, Family::Security)
            .with_category("injection")
            .with_url("https://example.com/search?q=1")
            .with_parameter("q")
            .with_confidence(confidence)
            .with_rule(format!("{}-sqli", plugin))
    }

    #[test]
    fn merges_cross_tool_duplicates() {
        let mut findings = vec![
            sqli("zap-baseline", "SQL Injection", 0.7),
            sqli("nuclei", "SQL injection ", 0.9),
            sqli("security-headers", "Missing CSP header", 0.9),
        ];
        findings[2].category = "headers".into();

        let merges = dedupe(&mut findings, 0.85);
        assert_eq!(merges.len(), 1);

        let active: Vec<&Finding> = findings.iter().filter(|f| !f.is_superseded()).collect();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].tool.plugin_id, "nuclei");
        assert_eq!(active[0].source_plugins(), vec!["nuclei", "zap-baseline"]);
        assert_eq!(findings[0].superseded_by.as_deref(), Some(findings[1].finding_id.as_str()));
        assert_eq!(findings.len(), 3);
    }

    #[test]
    fn different_parameters_stay_apart() {
        let mut findings = vec![sqli("zap", "SQL Injection", 0.7), sqli("zap", "SQL Injection", 0.7).with_parameter("id")];
        assert!(dedupe(&mut findings, 0.85).is_empty());
    }

    #[test]
    fn dissimilar_titles_stay_apart() {
        let mut findings = vec![
            sqli("zap", "SQL Injection", 0.7),
            sqli("nuclei", "Reflected Cross Site Scripting", 0.7),
        ];
        assert!(dedupe(&mut findings, 0.85).is_empty());
    }

    #[test]
    fn chains_point_at_the_final_survivor() {
        let mut findings = vec![
            sqli("a", "SQL Injection", 0.5),
            sqli("b", "SQL Injection", 0.6),
            sqli("c", "SQL Injection", 0.8),
        ];
        dedupe(&mut findings, 0.85);
        let survivor = findings[2].finding_id.clone();
        assert!(!findings[2].is_superseded());
        assert_eq!(findings[0].superseded_by.as_deref(), Some(survivor.as_str()));
        assert_eq!(findings[1].superseded_by.as_deref(), Some(survivor.as_str()));
        assert_eq!(findings[2].sources.len(), 3);
    }

    #[test]
    fn survivor_keeps_its_own_severity_and_tags() {
        let mut findings = vec![sqli("zap", "SQL Injection", 0.9), sqli("nuclei", "SQL Injection", 0.5)];
        findings[1].severity = Severity::Critical;
        findings[1].add_tag("intermittent");

        let merges = dedupe(&mut findings, 0.85);
        assert_eq!(merges.len(), 1);

        let survivor = &findings[0];
        assert_eq!(survivor.tool.plugin_id, "zap");
        assert_eq!(survivor.severity, Severity::High);
        assert!(!survivor.tags.iter().any(|t| t == "intermittent"));
        assert_eq!(survivor.source_plugins(), vec!["zap", "nuclei"]);
        assert_eq!(
            survivor.metadata.get(MERGED_SEVERITIES),
            Some(&serde_json::json!(["high", "critical"]))
        );
    }

    #[test]
    fn dedupe_is_idempotent() {
        let mut findings = vec![
            sqli("zap", "SQL Injection", 0.7),
            sqli("nuclei", "SQL Injection", 0.9),
            sqli("zap", "Blind SQL Injection (time based)", 0.6),
        ];
        dedupe(&mut findings, 0.85);
        let once = findings.clone();
        assert!(dedupe(&mut findings, 0.85).is_empty());
        assert_eq!(findings, once);
    }
}
