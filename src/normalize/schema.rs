//! Universal Finding schema enforcement

use serde_json::Value;
use url::Url;

use crate::domain::{
    FINDING_SCHEMA_VERSION, Family, Finding, Severity, is_valid_finding_id, is_valid_run_id,
    new_finding_id,
};

pub const MAX_TITLE_LEN: usize = 200;

/// Why a candidate finding was rejected
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaViolation {
    #[error("finding is not a JSON object")]
    NotAnObject,

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("field {field} does not match pattern: {value}")]
    InvalidPattern { field: &'static str, value: String },

    #[error("field {field} has unsupported value: {value}")]
    InvalidEnum { field: &'static str, value: String },

    #[error("title exceeds 200 characters ({0})")]
    TitleTooLong(usize),

    #[error("title is empty")]
    EmptyTitle,

    #[error("confidence {0} is outside [0, 1]")]
    ConfidenceOutOfRange(f64),

    #[error("unsupported schema_version: {0}")]
    UnsupportedSchemaVersion(String),

    #[error("field {field} is not a valid URI: {value}")]
    InvalidUri { field: &'static str, value: String },

    #[error("evidence #{0} has neither artifact_ref nor content")]
    EmptyEvidence(usize),

    #[error("malformed finding: {0}")]
    Malformed(String),
}

impl SchemaViolation {
    /// Short machine-readable reason used in audit records
    pub fn code(&self) -> &'static str {
        match self {
            SchemaViolation::NotAnObject => "not_an_object",
            SchemaViolation::MissingField(_) => "missing_field",
            SchemaViolation::InvalidPattern { .. } => "invalid_pattern",
            SchemaViolation::InvalidEnum { .. } => "invalid_enum",
            SchemaViolation::TitleTooLong(_) => "title_too_long",
            SchemaViolation::EmptyTitle => "empty_title",
            SchemaViolation::ConfidenceOutOfRange(_) => "confidence_out_of_range",
            SchemaViolation::UnsupportedSchemaVersion(_) => "unsupported_schema_version",
            SchemaViolation::InvalidUri { .. } => "invalid_uri",
            SchemaViolation::EmptyEvidence(_) => "empty_evidence",
            SchemaViolation::Malformed(_) => "malformed",
        }
    }
}

fn check_uri(field: &'static str, value: &str) -> Result<(), SchemaViolation> {
    match Url::parse(value) {
        Ok(_) => Ok(()),
        Err(_) => Err(SchemaViolation::InvalidUri {
            field,
            value: value.to_string(),
        }),
    }
}

/// Validate a typed finding against every schema constraint
pub fn validate_finding(finding: &Finding) -> Result<(), SchemaViolation> {
    if finding.schema_version != FINDING_SCHEMA_VERSION {
        return Err(SchemaViolation::UnsupportedSchemaVersion(
            finding.schema_version.clone(),
        ));
    }
    if !is_valid_finding_id(&finding.finding_id) {
        return Err(SchemaViolation::InvalidPattern {
            field: "finding_id",
            value: finding.finding_id.clone(),
        });
    }
    if !is_valid_run_id(&finding.run_id) {
        return Err(SchemaViolation::InvalidPattern {
            field: "run_id",
            value: finding.run_id.clone(),
        });
    }
    if finding.title.trim().is_empty() {
        return Err(SchemaViolation::EmptyTitle);
    }
    let title_len = finding.title.chars().count();
    if title_len > MAX_TITLE_LEN {
        return Err(SchemaViolation::TitleTooLong(title_len));
    }
    if !finding.confidence.is_finite() || !(0.0..=1.0).contains(&finding.confidence) {
        return Err(SchemaViolation::ConfidenceOutOfRange(finding.confidence));
    }
    if finding.tool.plugin_id.trim().is_empty() {
        return Err(SchemaViolation::MissingField("tool.plugin_id"));
    }
    if let Some(url) = &finding.location.url {
        check_uri("location.url", url)?;
    }
    for (idx, evidence) in finding.evidence.iter().enumerate() {
        if evidence.artifact_ref.is_none() && evidence.content.is_none() {
            return Err(SchemaViolation::EmptyEvidence(idx));
        }
    }
    if let Some(fix) = &finding.fix {
        for reference in &fix.references {
            check_uri("fix.references", reference)?;
        }
    }
    Ok(())
}

fn require_str<'a>(obj: &'a serde_json::Map<String, Value>, field: &'static str) -> Result<&'a str, SchemaViolation> {
    obj.get(field)
        .and_then(Value::as_str)
        .ok_or(SchemaViolation::MissingField(field))
}

/// Validate a raw JSON finding and convert it. Nothing is coerced: unknown
/// enum values and wrong types reject the candidate.
pub fn parse_finding(value: Value) -> Result<Finding, SchemaViolation> {
    let obj = value.as_object().ok_or(SchemaViolation::NotAnObject)?;
    require_str(obj, "finding_id")?;
    let finding = parse_candidate(value)?;
    validate_finding(&finding)?;
    Ok(finding)
}

/// Convert a plugin-emitted finding whose run identity is not known yet.
///
/// Same type and enum checks as [`parse_finding`], but `finding_id` and
/// `run_id` may be absent: the normalizer stamps them and then runs the
/// full validation.
pub fn parse_candidate(mut value: Value) -> Result<Finding, SchemaViolation> {
    let obj = value.as_object_mut().ok_or(SchemaViolation::NotAnObject)?;

    require_str(obj, "title")?;
    let severity = require_str(obj, "severity")?;
    if !Severity::ALL.iter().any(|s| s.as_str() == severity) {
        return Err(SchemaViolation::InvalidEnum {
            field: "severity",
            value: severity.to_string(),
        });
    }
    let family = require_str(obj, "family")?;
    if !Family::ALL.iter().any(|f| f.as_str() == family) {
        return Err(SchemaViolation::InvalidEnum {
            field: "family",
            value: family.to_string(),
        });
    }
    let tool = obj
        .get("tool")
        .and_then(Value::as_object)
        .ok_or(SchemaViolation::MissingField("tool"))?;
    require_str(tool, "plugin_id").map_err(|_| SchemaViolation::MissingField("tool.plugin_id"))?;
    if let Some(confidence) = obj.get("confidence") {
        let c = confidence
            .as_f64()
            .ok_or_else(|| SchemaViolation::Malformed("confidence must be a number".into()))?;
        if !(0.0..=1.0).contains(&c) {
            return Err(SchemaViolation::ConfidenceOutOfRange(c));
        }
    }
    if !obj.contains_key("finding_id") {
        obj.insert("finding_id".into(), Value::String(new_finding_id()));
    }

    serde_json::from_value(value).map_err(|e| SchemaViolation::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Evidence, Fix};
    use serde_json::json;

    fn valid() -> Value {
        json!({
            "schema_version": "1.0.0",
            "finding_id": "find_abc123",
            "run_id": "run_xyz789",
            "title": "SQL Injection in search",
            "severity": "high",
            "confidence": 0.92,
            "family": "security",
            "category": "injection",
            "tool": {"plugin_id": "zap-baseline", "rule_id": "40018"},
            "location": {"url": "https://example.com/search", "method": "GET", "parameter": "q"},
            "evidence": [{"type": "har", "artifact_ref": "artifacts/network/request-123.har"}],
            "fix": {"summary": "Use parameterized queries", "references": ["https://owasp.org/www-community/attacks/SQL_Injection"]}
        })
    }

    #[test]
    fn accepts_a_conformant_finding() {
        let finding = parse_finding(valid()).unwrap();
        assert_eq!(finding.severity, Severity::High);
        assert_eq!(finding.location.parameter.as_deref(), Some("q"));
    }

    #[test]
    fn rejects_each_constraint() {
        let cases: Vec<(Box<dyn Fn(&mut Value)>, &str)> = vec![
            (Box::new(|v: &mut Value| v["finding_id"] = json!("finding-1")), "invalid_pattern"),
            (Box::new(|v: &mut Value| v["run_id"] = json!("RUN_1")), "invalid_pattern"),
            (Box::new(|v: &mut Value| v["severity"] = json!("severe")), "invalid_enum"),
            (Box::new(|v: &mut Value| v["family"] = json!("quality")), "invalid_enum"),
            (Box::new(|v: &mut Value| v["confidence"] = json!(1.2)), "confidence_out_of_range"),
            (Box::new(|v: &mut Value| v["title"] = json!("x".repeat(201))), "title_too_long"),
            (Box::new(|v: &mut Value| v["tool"] = json!({"tool_name": "zap"})), "missing_field"),
            (Box::new(|v: &mut Value| v["location"]["url"] = json!("not a uri")), "invalid_uri"),
            (Box::new(|v: &mut Value| v["schema_version"] = json!("2.0.0")), "unsupported_schema_version"),
            (Box::new(|v: &mut Value| v["evidence"] = json!([{"type": "log"}])), "empty_evidence"),
        ];
        for (mutate, code) in cases {
            let mut value = valid();
            mutate(&mut value);
            let err = parse_finding(value).unwrap_err();
            assert_eq!(err.code(), code, "unexpected violation {:?}", err);
        }
        assert_eq!(parse_finding(json!([1, 2])).unwrap_err(), SchemaViolation::NotAnObject);
    }

    #[test]
    fn validates_typed_findings() {
        let mut finding = Finding::new("axe", "Missing label", Severity::Low, Family::Accessibility)
            .with_run("run_abc", "site")
            .with_confidence(0.7)
            .with_evidence(Evidence::inline("json", json!({"node": "input#q"})))
            .with_fix(Fix {
                summary: Some("Add a label".into()),
                guidance: None,
                references: vec!["https://dequeuniversity.com/rules/axe/4.8/label".into()],
            });
        assert!(validate_finding(&finding).is_ok());

        finding.tool.plugin_id = String::new();
        assert_eq!(
            validate_finding(&finding).unwrap_err(),
            SchemaViolation::MissingField("tool.plugin_id")
        );
    }

    #[test]
    fn candidates_may_omit_run_identity() {
        let mut value = valid();
        let obj = value.as_object_mut().unwrap();
        obj.remove("finding_id");
        obj.remove("run_id");
        let finding = parse_candidate(value).unwrap();
        assert!(is_valid_finding_id(&finding.finding_id));
        assert!(finding.run_id.is_empty());

        let mut value = valid();
        value["severity"] = json!("urgent");
        assert_eq!(parse_candidate(value).unwrap_err().code(), "invalid_enum");
    }
}
