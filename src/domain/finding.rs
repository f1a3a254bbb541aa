//! Finding model - one normalized, schema-conformant test result

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Family, Severity, new_finding_id};

pub const FINDING_SCHEMA_VERSION: &str = "1.0.0";

fn default_schema_version() -> String {
    FINDING_SCHEMA_VERSION.to_string()
}

/// Which plugin/tool produced a finding
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub plugin_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
}

/// A contributing tool provenance, accumulated when duplicates merge
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    pub plugin_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
}

impl From<&ToolInfo> for SourceRef {
    fn from(tool: &ToolInfo) -> Self {
        Self {
            plugin_id: tool.plugin_id.clone(),
            rule_id: tool.rule_id.clone(),
        }
    }
}

/// Where the issue was found
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
    /// Source file, for repository targets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

impl Location {
    pub fn is_empty(&self) -> bool {
        self.url.is_none()
            && self.method.is_none()
            && self.parameter.is_none()
            && self.file.is_none()
            && self.line.is_none()
    }
}

/// An artifact substantiating a finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    /// screenshot, har, video, trace, log, json, html, request, response, code
    #[serde(rename = "type")]
    pub evidence_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Evidence {
    pub fn artifact(evidence_type: impl Into<String>, artifact_ref: impl Into<String>) -> Self {
        Self {
            evidence_type: evidence_type.into(),
            artifact_ref: Some(artifact_ref.into()),
            content: None,
            description: None,
            timestamp: Some(Utc::now()),
        }
    }

    pub fn inline(evidence_type: impl Into<String>, content: impl Into<serde_json::Value>) -> Self {
        Self {
            evidence_type: evidence_type.into(),
            artifact_ref: None,
            content: Some(content.into()),
            description: None,
            timestamp: Some(Utc::now()),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Remediation guidance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fix {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<String>,
}

/// A normalized finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub finding_id: String,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub target_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub severity: Severity,
    #[serde(default)]
    pub confidence: f64,
    pub family: Family,
    #[serde(default)]
    pub category: String,
    pub tool: ToolInfo,
    #[serde(default, skip_serializing_if = "Location::is_empty")]
    pub location: Location,
    #[serde(default)]
    pub evidence: Vec<Evidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix: Option<Fix>,
    /// Every tool provenance merged into this finding
    #[serde(default)]
    pub sources: Vec<SourceRef>,
    /// Free-form tags such as `intermittent`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Stable identity across runs, used by history and baselines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Set when a duplicate was merged into another finding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

pub const TAG_INTERMITTENT: &str = "intermittent";

impl Finding {
    /// Create a new finding with minimal required fields
    pub fn new(
        plugin_id: impl Into<String>,
        title: impl Into<String>,
        severity: Severity,
        family: Family,
    ) -> Self {
        let tool = ToolInfo {
            plugin_id: plugin_id.into(),
            ..Default::default()
        };
        Self {
            schema_version: default_schema_version(),
            finding_id: new_finding_id(),
            run_id: String::new(),
            target_id: String::new(),
            title: title.into(),
            description: None,
            severity,
            confidence: 0.0,
            family,
            category: String::new(),
            sources: vec![SourceRef::from(&tool)],
            tool,
            location: Location::default(),
            evidence: Vec::new(),
            fix: None,
            tags: Vec::new(),
            fingerprint: None,
            superseded_by: None,
            metadata: BTreeMap::new(),
        }
    }

    // Builder methods
    pub fn with_run(mut self, run_id: impl Into<String>, target_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self.target_id = target_id.into();
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_rule(mut self, rule_id: impl Into<String>) -> Self {
        let rule_id = rule_id.into();
        self.tool.rule_id = Some(rule_id.clone());
        for source in self.sources.iter_mut() {
            if source.plugin_id == self.tool.plugin_id {
                source.rule_id = Some(rule_id.clone());
            }
        }
        self
    }

    pub fn with_tool(mut self, name: impl Into<String>, version: Option<String>) -> Self {
        self.tool.tool_name = Some(name.into());
        self.tool.tool_version = version;
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.location.url = Some(url.into());
        self
    }

    pub fn with_parameter(mut self, parameter: impl Into<String>) -> Self {
        self.location.parameter = Some(parameter.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.location.method = Some(method.into());
        self
    }

    pub fn with_file(mut self, file: impl Into<String>, line: Option<u32>) -> Self {
        self.location.file = Some(file.into());
        self.location.line = line;
        self
    }

    pub fn with_evidence(mut self, evidence: Evidence) -> Self {
        self.evidence.push(evidence);
        self
    }

    pub fn with_fix(mut self, fix: Fix) -> Self {
        self.fix = Some(fix);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.add_tag(tag);
        self
    }

    pub fn add_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded_by.is_some()
    }

    /// Add a contributing provenance, ignoring exact repeats
    pub fn add_source(&mut self, source: SourceRef) {
        if !self.sources.contains(&source) {
            self.sources.push(source);
        }
    }

    /// Plugin ids of every contributing source, without repeats
    pub fn source_plugins(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for s in &self.sources {
            if !out.contains(&s.plugin_id.as_str()) {
                out.push(s.plugin_id.as_str());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_populates_provenance() {
        let finding = Finding::new("zap-baseline", "SQL Injection", Severity::High, Family::Security)
            .with_run("run_abc123", "my-webapp")
            .with_confidence(0.9)
            .with_category("injection")
            .with_rule("40018")
            .with_url("https://example.com/search")
            .with_parameter("q")
            .with_tag(TAG_INTERMITTENT)
            .with_tag(TAG_INTERMITTENT);

        assert!(finding.finding_id.starts_with("find_"));
        assert_eq!(finding.tool.rule_id.as_deref(), Some("40018"));
        assert_eq!(finding.sources.len(), 1);
        assert_eq!(finding.sources[0].rule_id.as_deref(), Some("40018"));
        assert_eq!(finding.tags, vec![TAG_INTERMITTENT.to_string()]);
        assert_eq!(finding.schema_version, "1.0.0");
    }

    #[test]
    fn serializes_schema_field_names() {
        let finding = Finding::new("axe", "Missing alt text", Severity::Medium, Family::Accessibility)
            .with_evidence(Evidence::artifact("screenshot", "artifacts/axe/shot.png"));
        let json = serde_json::to_value(&finding).unwrap();
        assert_eq!(json["tool"]["plugin_id"], "axe");
        assert_eq!(json["severity"], "medium");
        assert_eq!(json["family"], "accessibility");
        assert_eq!(json["evidence"][0]["type"], "screenshot");
        assert!(json.get("location").is_none());
    }

    #[test]
    fn source_plugins_are_unique() {
        let mut finding = Finding::new("zap", "XSS", Severity::High, Family::Security);
        finding.add_source(SourceRef {
            plugin_id: "nuclei".into(),
            rule_id: Some("xss-reflected".into()),
        });
        finding.add_source(SourceRef {
            plugin_id: "zap".into(),
            rule_id: Some("40012".into()),
        });
        assert_eq!(finding.source_plugins(), vec!["zap", "nuclei"]);
    }
}
