//! SARIF (Static Analysis Results Interchange Format) 2.1.0
//!
//! Emitted by Semgrep, CodeQL and ZAP among others. Format reference:
//! https://docs.oasis-open.org/sarif/sarif/v2.1.0/sarif-v2.1.0.html

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::json;

use super::{FormatContext, id_to_title, map_severity, severity_from_score};
use crate::domain::{Evidence, Fix, Severity};
use crate::normalize::{PluginOutput, SchemaViolation};

// Only the parts of the log the adapter reads are modelled.

#[derive(Debug, Deserialize)]
struct Sarif {
    version: Option<String>,
    runs: Vec<SarifRun>,
}

#[derive(Debug, Deserialize)]
struct SarifRun {
    tool: SarifTool,
    results: Option<Vec<SarifResultItem>>,
}

#[derive(Debug, Deserialize)]
struct SarifTool {
    driver: SarifDriver,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SarifDriver {
    name: String,
    version: Option<String>,
    semantic_version: Option<String>,
    rules: Option<Vec<SarifRule>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SarifRule {
    id: String,
    name: Option<String>,
    short_description: Option<SarifText>,
    full_description: Option<SarifText>,
    help: Option<SarifText>,
    help_uri: Option<String>,
    default_configuration: Option<SarifRuleDefaults>,
    properties: Option<SarifRuleProperties>,
}

/// Property bag used by CodeQL/Semgrep style rules
#[derive(Debug, Deserialize)]
struct SarifRuleProperties {
    precision: Option<String>,
    #[serde(rename = "security-severity")]
    security_severity: Option<String>,
    tags: Option<Vec<String>>,
    cwe: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SarifRuleDefaults {
    level: Option<String>,
}

/// `message`, `shortDescription`, `snippet` and friends all carry `text`
#[derive(Debug, Deserialize)]
struct SarifText {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SarifResultItem {
    rule_id: Option<String>,
    rule_index: Option<usize>,
    level: Option<String>,
    message: SarifText,
    locations: Option<Vec<SarifLocation>>,
    code_flows: Option<Vec<SarifCodeFlow>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SarifLocation {
    physical_location: Option<SarifPhysicalLocation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SarifPhysicalLocation {
    artifact_location: Option<SarifArtifact>,
    region: Option<SarifRegion>,
}

#[derive(Debug, Deserialize)]
struct SarifArtifact {
    uri: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SarifRegion {
    start_line: Option<u32>,
    start_column: Option<u32>,
    snippet: Option<SarifText>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SarifCodeFlow {
    thread_flows: Vec<SarifThreadFlow>,
}

#[derive(Debug, Deserialize)]
struct SarifThreadFlow {
    locations: Vec<SarifFlowStep>,
}

#[derive(Debug, Deserialize)]
struct SarifFlowStep {
    location: SarifLocation,
}

impl SarifPhysicalLocation {
    fn uri(&self) -> Option<&str> {
        self.artifact_location.as_ref().and_then(|a| a.uri.as_deref())
    }

    fn describe(&self) -> Option<String> {
        let uri = self.uri()?;
        match self.region.as_ref().and_then(|r| r.start_line) {
            Some(line) => Some(format!("{}:{}", uri, line)),
            None => Some(uri.to_string()),
        }
    }
}

/// Rule precision to a confidence estimate
fn precision_confidence(precision: &str) -> Option<f64> {
    match precision.to_lowercase().as_str() {
        "very-high" | "certain" => Some(0.9),
        "high" => Some(0.8),
        "medium" | "firm" => Some(0.6),
        "low" | "tentative" => Some(0.4),
        _ => None,
    }
}

fn is_web_uri(uri: &str) -> bool {
    uri.starts_with("http://") || uri.starts_with("https://")
}

pub fn parse_sarif(content: &str, ctx: &FormatContext) -> PluginOutput {
    let mut output = PluginOutput::new();
    if content.trim().is_empty() {
        return output;
    }

    let sarif: Sarif = match serde_json::from_str(content) {
        Ok(s) => s,
        Err(e) => {
            output
                .rejected
                .push(SchemaViolation::Malformed(format!("Failed to parse SARIF JSON: {}", e)));
            return output;
        }
    };
    if let Some(version) = sarif.version.as_deref().filter(|v| *v != "2.1.0") {
        output
            .warnings
            .push(format!("SARIF version {} is not 2.1.0, parsing anyway", version));
    }

    for run in &sarif.runs {
        let driver = &run.tool.driver;
        let rules_by_id: HashMap<&str, &SarifRule> = driver
            .rules
            .as_ref()
            .map(|rules| rules.iter().map(|r| (r.id.as_str(), r)).collect())
            .unwrap_or_default();
        let version = driver.semantic_version.clone().or_else(|| driver.version.clone());
        let run_ctx = ctx.clone().with_tool(driver.name.clone(), version);

        let Some(results) = &run.results else {
            continue;
        };

        for item in results {
            let rule = item
                .rule_id
                .as_deref()
                .and_then(|id| rules_by_id.get(id).copied())
                .or_else(|| {
                    item.rule_index
                        .and_then(|i| driver.rules.as_ref().and_then(|rules| rules.get(i)))
                });
            let Some(rule_id) = item.rule_id.clone().or_else(|| rule.map(|r| r.id.clone())) else {
                output.warnings.push("Skipped result without ruleId".to_string());
                continue;
            };
            let props = rule.and_then(|r| r.properties.as_ref());

            let title = rule
                .and_then(|r| r.short_description.as_ref())
                .and_then(|d| d.text.clone())
                .or_else(|| rule.and_then(|r| r.name.clone()))
                .unwrap_or_else(|| id_to_title(&rule_id));

            let severity = props
                .and_then(|p| p.security_severity.as_deref())
                .and_then(|s| s.parse::<f64>().ok())
                .map(severity_from_score)
                .or_else(|| {
                    item.level
                        .as_deref()
                        .or_else(|| {
                            rule.and_then(|r| r.default_configuration.as_ref())
                                .and_then(|c| c.level.as_deref())
                        })
                        .and_then(map_severity)
                })
                .unwrap_or(Severity::Medium);

            let tags = props.and_then(|p| p.tags.clone()).unwrap_or_default();
            let category = tags
                .iter()
                .map(|t| t.to_lowercase())
                .find(|t| t != "security" && !t.starts_with("cwe") && !t.starts_with("external/"))
                .unwrap_or_else(|| "unknown".to_string());

            let mut finding = run_ctx
                .finding(title, severity, None)
                .with_rule(rule_id)
                .with_category(category);

            if let Some(confidence) = props
                .and_then(|p| p.precision.as_deref())
                .and_then(precision_confidence)
            {
                finding = finding.with_confidence(confidence);
            }

            let description = item.message.text.clone().or_else(|| {
                rule.and_then(|r| r.full_description.as_ref())
                    .and_then(|d| d.text.clone())
            });
            if let Some(desc) = description {
                finding = finding.with_description(desc);
            }

            let primary = item
                .locations
                .as_ref()
                .and_then(|locs| locs.iter().find_map(|l| l.physical_location.as_ref()));
            if let Some(location) = primary {
                if let Some(uri) = location.uri() {
                    if is_web_uri(uri) {
                        finding = finding.with_url(uri);
                    } else {
                        let region = location.region.as_ref();
                        finding = finding.with_file(uri, region.and_then(|r| r.start_line));
                        finding.location.column = region.and_then(|r| r.start_column);
                    }
                }
                if let Some(snippet) = location
                    .region
                    .as_ref()
                    .and_then(|r| r.snippet.as_ref())
                    .and_then(|s| s.text.clone())
                {
                    finding = finding.with_evidence(Evidence::inline("snippet", snippet));
                }
            }

            if let Some(cwe) = props.and_then(|p| p.cwe.clone()) {
                let cwe = if cwe.starts_with("CWE-") { cwe } else { format!("CWE-{}", cwe) };
                finding.metadata.insert("cwe".into(), json!(cwe));
            }

            // Taint paths as ordered location lists
            for flow in item.code_flows.iter().flatten() {
                for thread in &flow.thread_flows {
                    let steps: Vec<String> = thread
                        .locations
                        .iter()
                        .filter_map(|l| l.location.physical_location.as_ref())
                        .filter_map(SarifPhysicalLocation::describe)
                        .collect();
                    if steps.len() > 1 {
                        finding = finding.with_evidence(
                            Evidence::inline("code_flow", json!(steps))
                                .with_description("Data flow from source to sink"),
                        );
                    }
                }
            }

            let help = rule.and_then(|r| r.help.as_ref()).and_then(|h| h.text.clone());
            let references: Vec<String> = rule
                .and_then(|r| r.help_uri.clone())
                .filter(|u| url::Url::parse(u).is_ok())
                .into_iter()
                .collect();
            if help.is_some() || !references.is_empty() {
                finding = finding.with_fix(Fix {
                    summary: None,
                    guidance: help,
                    references,
                });
            }

            output.findings.push(finding);
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Family;

    const SAMPLE_SARIF: &str = r#"{
        "version": "2.1.0",
        "runs": [{
            "tool": {
                "driver": {
                    "name": "semgrep",
                    "version": "1.0.0",
                    "rules": [{
                        "id": "go.lang.security.audit.xss.direct-response-write",
                        "name": "DirectResponseWrite",
                        "shortDescription": {"text": "Potential XSS vulnerability"},
                        "helpUri": "https://owasp.org/www-community/attacks/xss/",
                        "defaultConfiguration": {"level": "warning"},
                        "properties": {"precision": "high", "cwe": "79", "tags": ["security", "xss"]}
                    }]
                }
            },
            "results": [{
                "ruleId": "go.lang.security.audit.xss.direct-response-write",
                "message": {"text": "User input flows into response without escaping"},
                "locations": [{
                    "physicalLocation": {
                        "artifactLocation": {"uri": "src/handler.go"},
                        "region": {"startLine": 42, "startColumn": 5}
                    }
                }],
                "codeFlows": [{
                    "threadFlows": [{
                        "locations": [
                            {"location": {"physicalLocation": {"artifactLocation": {"uri": "src/handler.go"}, "region": {"startLine": 30}}}},
                            {"location": {"physicalLocation": {"artifactLocation": {"uri": "src/handler.go"}, "region": {"startLine": 42}}}}
                        ]
                    }]
                }]
            }, {
                "level": "error",
                "message": {"text": "no rule id"}
            }]
        }]
    }"#;

    #[test]
    fn parses_sarif_results() {
        let ctx = FormatContext::new("semgrep", Family::Security);
        let output = parse_sarif(SAMPLE_SARIF, &ctx);

        assert_eq!(output.findings.len(), 1);
        assert_eq!(output.warnings.len(), 1);

        let finding = &output.findings[0];
        assert_eq!(finding.title, "Potential XSS vulnerability");
        assert_eq!(finding.severity, Severity::Medium);
        assert_eq!(finding.confidence, 0.8);
        assert_eq!(finding.category, "xss");
        assert_eq!(finding.location.file.as_deref(), Some("src/handler.go"));
        assert_eq!(finding.location.line, Some(42));
        assert_eq!(finding.location.column, Some(5));
        assert_eq!(finding.metadata["cwe"], json!("CWE-79"));
        assert_eq!(finding.tool.tool_name.as_deref(), Some("semgrep"));
        assert!(finding.evidence.iter().any(|e| e.evidence_type == "code_flow"));
    }

    #[test]
    fn web_locations_and_security_severity() {
        let content = r#"{"version":"2.1.0","runs":[{"tool":{"driver":{"name":"ZAP","rules":[
            {"id":"40012","properties":{"security-severity":"8.1"}}]}},
            "results":[{"ruleId":"40012","message":{"text":"Cross Site Scripting (Reflected)"},
            "locations":[{"physicalLocation":{"artifactLocation":{"uri":"https://example.com/search?q=1"}}}]}]}]}"#;
        let output = parse_sarif(content, &FormatContext::new("zap-baseline", Family::Security));
        let finding = &output.findings[0];
        assert_eq!(finding.severity, Severity::High);
        assert_eq!(finding.title, "40012");
        assert_eq!(finding.location.url.as_deref(), Some("https://example.com/search?q=1"));
    }
}
