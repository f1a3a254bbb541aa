//! Tool output formats
//!
//! These parsers are the only tool-specific normalization code in the kernel.
//! Each one turns the primary output artifact of a job into candidate
//! findings. A line or record that cannot be parsed becomes a warning or a
//! rejected candidate; nothing is patched up to make it fit.

mod issues;
mod native;
mod nuclei;
mod sarif;

use serde::{Deserialize, Serialize};

use crate::domain::{Evidence, Family, Finding, Severity};
use crate::normalize::PluginOutput;

pub use issues::parse_issues;
pub use native::parse_native;
pub use nuclei::{NucleiFinding, parse_nuclei};
pub use sarif::parse_sarif;

/// Evidence type pointing back at the artifact a finding was parsed from
pub const RAW_OUTPUT_EVIDENCE: &str = "raw_output";

/// Format of a plugin's primary output file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Findings already in the universal schema (array, `{findings: [...]}` or JSONL)
    #[default]
    Native,
    /// Generic `{"issues": [...]}` report
    Issues,
    /// Nuclei JSONL
    Nuclei,
    /// SARIF 2.1.0
    Sarif,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Native => "native",
            OutputFormat::Issues => "issues",
            OutputFormat::Nuclei => "nuclei",
            OutputFormat::Sarif => "sarif",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "native" | "findings" => Some(OutputFormat::Native),
            "issues" => Some(OutputFormat::Issues),
            "nuclei" | "jsonl" => Some(OutputFormat::Nuclei),
            "sarif" => Some(OutputFormat::Sarif),
            _ => None,
        }
    }

    pub fn parse(&self, content: &str, ctx: &FormatContext) -> PluginOutput {
        match self {
            OutputFormat::Native => parse_native(content, ctx),
            OutputFormat::Issues => parse_issues(content, ctx),
            OutputFormat::Nuclei => parse_nuclei(content, ctx),
            OutputFormat::Sarif => parse_sarif(content, ctx),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Provenance and defaults applied to every finding a parser builds
#[derive(Debug, Clone)]
pub struct FormatContext {
    pub plugin_id: String,
    pub tool_name: String,
    pub tool_version: Option<String>,
    /// Family for records that do not name one
    pub family: Family,
    pub base_confidence: f64,
    /// Reference to the artifact being parsed, attached as evidence
    pub artifact_ref: Option<String>,
}

impl FormatContext {
    pub fn new(plugin_id: impl Into<String>, family: Family) -> Self {
        let plugin_id = plugin_id.into();
        Self {
            tool_name: plugin_id.clone(),
            plugin_id,
            tool_version: None,
            family,
            base_confidence: super::DEFAULT_BASE_CONFIDENCE,
            artifact_ref: None,
        }
    }

    pub fn with_tool(mut self, name: impl Into<String>, version: Option<String>) -> Self {
        self.tool_name = name.into();
        self.tool_version = version;
        self
    }

    pub fn with_base_confidence(mut self, confidence: f64) -> Self {
        self.base_confidence = confidence;
        self
    }

    pub fn with_artifact_ref(mut self, reference: impl Into<String>) -> Self {
        self.artifact_ref = Some(reference.into());
        self
    }

    /// A finding carrying this context's provenance and base confidence
    pub fn finding(&self, title: impl Into<String>, severity: Severity, family: Option<Family>) -> Finding {
        let mut finding = Finding::new(
            self.plugin_id.clone(),
            title,
            severity,
            family.unwrap_or(self.family),
        )
        .with_tool(self.tool_name.clone(), self.tool_version.clone())
        .with_confidence(self.base_confidence);
        if let Some(reference) = &self.artifact_ref {
            finding = finding.with_evidence(
                Evidence::artifact(RAW_OUTPUT_EVIDENCE, reference.clone())
                    .with_description("Tool output this finding was parsed from"),
            );
        }
        finding
    }
}

/// Map tool severity vocabularies (SARIF levels, scanner risk names) onto ours
pub fn map_severity(level: &str) -> Option<Severity> {
    match level.trim().to_lowercase().as_str() {
        "critical" | "crit" | "blocker" => Some(Severity::Critical),
        "error" | "high" | "major" => Some(Severity::High),
        "warning" | "medium" | "moderate" => Some(Severity::Medium),
        "note" | "low" | "minor" => Some(Severity::Low),
        "info" | "informational" | "none" | "unknown" => Some(Severity::Info),
        _ => None,
    }
}

/// Map a CVSS-style numeric score (0-10) onto a severity
pub fn severity_from_score(score: f64) -> Severity {
    if score >= 9.0 {
        Severity::Critical
    } else if score >= 7.0 {
        Severity::High
    } else if score >= 4.0 {
        Severity::Medium
    } else if score > 0.0 {
        Severity::Low
    } else {
        Severity::Info
    }
}

/// Turn a rule or template id into a readable title
/// (`cve-2021-44228-log4j` becomes `CVE 2021 44228 Log4j`)
pub fn id_to_title(id: &str) -> String {
    id.rsplit('.')
        .next()
        .unwrap_or(id)
        .replace(['-', '_'], " ")
        .split_whitespace()
        .map(|word| {
            if word.eq_ignore_ascii_case("cve") || word.eq_ignore_ascii_case("cwe") {
                word.to_uppercase()
            } else {
                let mut chars = word.chars();
                match chars.next() {
                    None => String::new(),
                    Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                }
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// A JSON field that tools emit either as a single value or a list
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T: Clone> OneOrMany<T> {
    pub fn to_vec(&self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v.clone()],
            OneOrMany::Many(v) => v.clone(),
        }
    }

    pub fn first(&self) -> Option<T> {
        match self {
            OneOrMany::One(v) => Some(v.clone()),
            OneOrMany::Many(v) => v.first().cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_tool_severities() {
        assert_eq!(map_severity("error"), Some(Severity::High));
        assert_eq!(map_severity("Warning"), Some(Severity::Medium));
        assert_eq!(map_severity("note"), Some(Severity::Low));
        assert_eq!(map_severity("bogus"), None);
        assert_eq!(severity_from_score(9.8), Severity::Critical);
        assert_eq!(severity_from_score(5.3), Severity::Medium);
    }

    #[test]
    fn titles_from_ids() {
        assert_eq!(id_to_title("cve-2021-44228-log4j"), "CVE 2021 44228 Log4j");
        assert_eq!(id_to_title("exposed-panels"), "Exposed Panels");
        assert_eq!(id_to_title("go.lang.security.audit.xss.direct-response-write"), "Direct Response Write");
    }

    #[test]
    fn format_names() {
        assert_eq!(OutputFormat::from_str("SARIF"), Some(OutputFormat::Sarif));
        assert_eq!(OutputFormat::from_str("jsonl"), Some(OutputFormat::Nuclei));
        assert_eq!(OutputFormat::default().as_str(), "native");
    }
}
