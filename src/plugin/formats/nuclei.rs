//! Nuclei JSONL output
//!
//! Nuclei writes one JSON object per line. Template metadata (`info`) carries
//! the name, severity, classification and remediation.

use serde::Deserialize;
use serde_json::json;

use super::{FormatContext, OneOrMany, id_to_title, map_severity};
use crate::domain::{Evidence, Fix, Severity};
use crate::normalize::PluginOutput;

/// Nuclei finding output (per-line JSON)
#[derive(Debug, Deserialize)]
pub struct NucleiFinding {
    /// Template ID (e.g., "cve-2021-44228-log4j")
    #[serde(rename = "template-id")]
    pub template_id: String,

    pub info: Option<NucleiInfo>,

    pub host: Option<String>,

    #[serde(rename = "matched-at")]
    pub matched_at: Option<String>,

    /// Protocol of the template (http, dns, network, ...)
    #[serde(rename = "type")]
    pub scan_type: Option<String>,

    pub ip: Option<String>,

    pub timestamp: Option<String>,

    #[serde(rename = "curl-command")]
    pub curl_command: Option<String>,

    #[serde(rename = "matcher-name")]
    pub matcher_name: Option<String>,

    #[serde(rename = "extracted-results")]
    pub extracted_results: Option<Vec<String>>,

    pub request: Option<String>,

    pub response: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NucleiInfo {
    pub name: Option<String>,
    pub author: Option<OneOrMany<String>>,
    pub tags: Option<OneOrMany<String>>,
    pub severity: Option<String>,
    pub description: Option<String>,
    pub reference: Option<OneOrMany<String>>,
    pub classification: Option<NucleiClassification>,
    pub remediation: Option<String>,
}

impl NucleiInfo {
    /// Tags arrive either as a list or as one comma-separated string
    pub fn tag_list(&self) -> Vec<String> {
        self.tags
            .as_ref()
            .map(|t| {
                t.to_vec()
                    .iter()
                    .flat_map(|s| s.split(','))
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
pub struct NucleiClassification {
    #[serde(rename = "cve-id")]
    pub cve_id: Option<OneOrMany<String>>,

    #[serde(rename = "cwe-id")]
    pub cwe_id: Option<OneOrMany<String>>,

    #[serde(rename = "cvss-metrics")]
    pub cvss_metrics: Option<String>,

    #[serde(rename = "cvss-score")]
    pub cvss_score: Option<f64>,
}

/// Category from template tags, most specific class first
fn category_for(tags: &[String], scan_type: Option<&str>) -> String {
    const KNOWN: [(&str, &str); 9] = [
        ("sqli", "injection"),
        ("xss", "injection"),
        ("rce", "injection"),
        ("lfi", "path-traversal"),
        ("ssrf", "ssrf"),
        ("exposure", "exposure"),
        ("misconfig", "misconfiguration"),
        ("panel", "exposure"),
        ("cve", "known-vulnerability"),
    ];
    for (tag, category) in KNOWN {
        if tags.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
            return category.to_string();
        }
    }
    scan_type.unwrap_or("unknown").to_string()
}

pub fn parse_nuclei(content: &str, ctx: &FormatContext) -> PluginOutput {
    let mut output = PluginOutput::new();

    for (line_num, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let record: NucleiFinding = match serde_json::from_str(line) {
            Ok(f) => f,
            Err(e) => {
                output
                    .warnings
                    .push(format!("Line {}: Failed to parse JSON: {}", line_num + 1, e));
                continue;
            }
        };

        let info = record.info.as_ref();
        let title = info
            .and_then(|i| i.name.clone())
            .unwrap_or_else(|| id_to_title(&record.template_id));
        let severity = info
            .and_then(|i| i.severity.as_deref())
            .and_then(map_severity)
            .unwrap_or(Severity::Info);
        let tags = info.map(NucleiInfo::tag_list).unwrap_or_default();

        let mut finding = ctx
            .finding(title, severity, None)
            .with_rule(record.template_id.clone())
            .with_category(category_for(&tags, record.scan_type.as_deref()));

        if let Some(url) = record.matched_at.clone().or_else(|| record.host.clone()) {
            finding = finding.with_url(url);
        }
        if let Some(description) = info.and_then(|i| i.description.clone()) {
            finding = finding.with_description(description);
        }
        for tag in &tags {
            finding = finding.with_tag(tag.clone());
        }

        if let Some(curl) = &record.curl_command {
            finding = finding.with_evidence(
                Evidence::inline("curl", curl.clone()).with_description("Reproduce with this request"),
            );
        }
        if record.request.is_some() || record.response.is_some() {
            finding = finding.with_evidence(Evidence::inline(
                "http",
                json!({"request": record.request, "response": record.response}),
            ));
        }
        if let Some(extracted) = record.extracted_results.as_ref().filter(|e| !e.is_empty()) {
            finding = finding.with_evidence(
                Evidence::inline("extracted", extracted.join(", "))
                    .with_description(record.matcher_name.clone().unwrap_or_default()),
            );
        }

        if let Some(class) = info.and_then(|i| i.classification.as_ref()) {
            if let Some(cwe) = class.cwe_id.as_ref().and_then(OneOrMany::first) {
                let cwe = if cwe.to_uppercase().starts_with("CWE-") {
                    cwe.to_uppercase()
                } else {
                    format!("CWE-{}", cwe)
                };
                finding.metadata.insert("cwe".into(), json!(cwe));
            }
            if let Some(cve) = class.cve_id.as_ref().and_then(OneOrMany::first) {
                finding.metadata.insert("cve".into(), json!(cve));
            }
            if let Some(score) = class.cvss_score {
                finding.metadata.insert("cvss_score".into(), json!(score));
            }
            if let Some(metrics) = &class.cvss_metrics {
                finding.metadata.insert("cvss_metrics".into(), json!(metrics));
            }
        }

        let references: Vec<String> = info
            .and_then(|i| i.reference.as_ref())
            .map(|r| r.to_vec())
            .unwrap_or_default()
            .into_iter()
            .filter(|r| url::Url::parse(r).is_ok())
            .collect();
        let remediation = info.and_then(|i| i.remediation.clone());
        if remediation.is_some() || !references.is_empty() {
            finding = finding.with_fix(Fix {
                summary: remediation,
                guidance: None,
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
    use crate::domain::Family;

    const SAMPLE_NUCLEI: &str = r#"{"template-id":"cve-2021-44228-log4j","info":{"name":"Apache Log4j RCE","author":"pdteam","severity":"critical","description":"Apache Log4j2 is vulnerable to RCE via JNDI lookup.","reference":["https://nvd.nist.gov/vuln/detail/CVE-2021-44228"],"classification":{"cve-id":"CVE-2021-44228","cwe-id":"CWE-502","cvss-metrics":"CVSS:3.1/AV:N/AC:L/PR:N/UI:N/S:C/C:H/I:H/A:H","cvss-score":10.0},"tags":"cve,cve2021,rce,log4j,apache"},"host":"https://target.com","matched-at":"https://target.com/api/login","type":"http","curl-command":"curl -X POST https://target.com/api/login","timestamp":"2024-01-15T10:30:00Z"}
{"template-id":"exposed-panels","info":{"severity":"medium","tags":["panel","exposure"]},"host":"https://target.com","matched-at":"https://target.com/admin","type":"http"}
this line is not json"#;

    #[test]
    fn parses_nuclei_jsonl() {
        let ctx = FormatContext::new("nuclei", Family::Security).with_base_confidence(0.7);
        let output = parse_nuclei(SAMPLE_NUCLEI, &ctx);

        assert_eq!(output.findings.len(), 2);
        assert_eq!(output.warnings.len(), 1);

        let log4j = &output.findings[0];
        assert_eq!(log4j.title, "Apache Log4j RCE");
        assert_eq!(log4j.severity, Severity::Critical);
        assert_eq!(log4j.category, "injection");
        assert_eq!(log4j.location.url.as_deref(), Some("https://target.com/api/login"));
        assert_eq!(log4j.metadata["cwe"], json!("CWE-502"));
        assert_eq!(log4j.metadata["cvss_score"], json!(10.0));
        assert!(log4j.evidence.iter().any(|e| e.evidence_type == "curl"));
        assert_eq!(log4j.fix.as_ref().unwrap().references.len(), 1);
        assert_eq!(log4j.confidence, 0.7);

        let panel = &output.findings[1];
        assert_eq!(panel.title, "Exposed Panels");
        assert_eq!(panel.severity, Severity::Medium);
        assert_eq!(panel.category, "exposure");
        assert!(panel.has_tag("panel"));
        assert_eq!(panel.tool.rule_id.as_deref(), Some("exposed-panels"));
    }
}
