//! Generic `{"issues": [...]}` reports
//!
//! The shape most wrapper scripts produce: a flat list of issues with a
//! title, a tool severity and an optional location and fix.

use serde::Deserialize;
use serde_json::Value;

use super::{FormatContext, OneOrMany, map_severity};
use crate::domain::{Evidence, Family, Fix, Severity};
use crate::normalize::{PluginOutput, SchemaViolation};

#[derive(Debug, Deserialize)]
struct IssuesReport {
    #[serde(default)]
    issues: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct Issue {
    title: Option<String>,
    description: Option<String>,
    severity: Option<String>,
    confidence: Option<f64>,
    family: Option<String>,
    category: Option<String>,
    rule_id: Option<String>,
    url: Option<String>,
    method: Option<String>,
    parameter: Option<String>,
    file: Option<String>,
    line: Option<u32>,
    fix: Option<String>,
    guidance: Option<String>,
    references: Option<OneOrMany<String>>,
}

pub fn parse_issues(content: &str, ctx: &FormatContext) -> PluginOutput {
    let mut output = PluginOutput::new();
    if content.trim().is_empty() {
        return output;
    }

    let report: IssuesReport = match serde_json::from_str(content) {
        Ok(r) => r,
        Err(e) => {
            output.rejected.push(SchemaViolation::Malformed(format!(
                "Failed to parse issues report: {}",
                e
            )));
            return output;
        }
    };

    for raw in report.issues {
        let issue: Issue = match serde_json::from_value(raw.clone()) {
            Ok(i) => i,
            Err(e) => {
                output.rejected.push(SchemaViolation::Malformed(e.to_string()));
                continue;
            }
        };
        let Some(title) = issue.title.filter(|t| !t.trim().is_empty()) else {
            output.rejected.push(SchemaViolation::MissingField("title"));
            continue;
        };

        let severity = issue
            .severity
            .as_deref()
            .map(|s| {
                map_severity(s).unwrap_or_else(|| {
                    output
                        .warnings
                        .push(format!("Unknown severity '{}' for '{}', using medium", s, title));
                    Severity::Medium
                })
            })
            .unwrap_or(Severity::Medium);

        let family = match issue.family.as_deref() {
            None => None,
            Some(name) => match Family::from_str(name) {
                Some(f) => Some(f),
                None => {
                    output.rejected.push(SchemaViolation::InvalidEnum {
                        field: "family",
                        value: name.to_string(),
                    });
                    continue;
                }
            },
        };

        let mut finding = ctx
            .finding(title, severity, family)
            .with_category(issue.category.unwrap_or_else(|| "unknown".to_string()))
            .with_evidence(Evidence::inline("json", raw).with_description("Issue as reported by the tool"));
        if let Some(confidence) = issue.confidence {
            finding = finding.with_confidence(confidence);
        }
        if let Some(description) = issue.description {
            finding = finding.with_description(description);
        }
        if let Some(rule) = issue.rule_id {
            finding = finding.with_rule(rule);
        }
        if let Some(url) = issue.url {
            finding = finding.with_url(url);
        }
        if let Some(method) = issue.method {
            finding = finding.with_method(method.to_uppercase());
        }
        if let Some(parameter) = issue.parameter {
            finding = finding.with_parameter(parameter);
        }
        if let Some(file) = issue.file {
            finding = finding.with_file(file, issue.line);
        }
        let references = issue.references.map(|r| r.to_vec()).unwrap_or_default();
        if issue.fix.is_some() || issue.guidance.is_some() || !references.is_empty() {
            finding = finding.with_fix(Fix {
                summary: issue.fix,
                guidance: issue.guidance,
                references,
            });
        }
        output.findings.push(finding);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"{"issues": [
        {"title": "Reflected XSS", "severity": "high", "confidence": 0.8, "category": "injection",
         "rule_id": "xss-01", "url": "https://example.com/search", "parameter": "q",
         "fix": "Encode output", "references": ["https://owasp.org/www-community/attacks/xss/"]},
        {"title": "Slow page", "severity": "whatever", "family": "performance"},
        {"severity": "low"},
        {"title": "Odd", "family": "quality"}
    ]}"#;

    #[test]
    fn maps_issue_fields() {
        let ctx = FormatContext::new("my-tool", Family::Security).with_base_confidence(0.6);
        let output = parse_issues(REPORT, &ctx);
        assert_eq!(output.findings.len(), 2);
        assert_eq!(output.rejected.len(), 2);

        let xss = &output.findings[0];
        assert_eq!(xss.severity, Severity::High);
        assert_eq!(xss.confidence, 0.8);
        assert_eq!(xss.category, "injection");
        assert_eq!(xss.tool.rule_id.as_deref(), Some("xss-01"));
        assert_eq!(xss.location.parameter.as_deref(), Some("q"));
        assert_eq!(xss.fix.as_ref().unwrap().references.len(), 1);
        assert_eq!(xss.family, Family::Security);

        let slow = &output.findings[1];
        assert_eq!(slow.severity, Severity::Medium);
        assert_eq!(slow.confidence, 0.6);
        assert_eq!(slow.family, Family::Performance);
        assert_eq!(output.warnings.len(), 1);
    }

    #[test]
    fn unparseable_report_is_rejected() {
        let ctx = FormatContext::new("my-tool", Family::Security);
        let output = parse_issues("<html>", &ctx);
        assert!(output.findings.is_empty());
        assert_eq!(output.rejected[0].code(), "malformed");
    }
}
