//! Findings emitted directly in the universal schema

use serde_json::Value;

use super::FormatContext;
use crate::normalize::{PluginOutput, SchemaViolation, parse_candidate};

/// Parse a JSON array, a `{"findings": [...]}` object or JSON lines.
///
/// Records may omit `finding_id`, `run_id` and `confidence`; the first two
/// are stamped by the normalizer and confidence falls back to the plugin's
/// base confidence. Every other field must already conform.
pub fn parse_native(content: &str, ctx: &FormatContext) -> PluginOutput {
    let mut output = PluginOutput::new();
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return output;
    }

    let records: Vec<Value> = match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Array(items)) => items,
        Ok(Value::Object(mut obj)) => match obj.remove("findings") {
            Some(Value::Array(items)) => items,
            Some(_) => {
                output.rejected.push(SchemaViolation::Malformed(
                    "\"findings\" must be an array".into(),
                ));
                return output;
            }
            None => vec![Value::Object(obj)],
        },
        Ok(_) => {
            output.rejected.push(SchemaViolation::NotAnObject);
            return output;
        }
        Err(_) => {
            let mut records = Vec::new();
            for (line_num, line) in trimmed.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(line) {
                    Ok(v) => records.push(v),
                    Err(e) => output.warnings.push(format!(
                        "Line {}: Failed to parse JSON: {}",
                        line_num + 1,
                        e
                    )),
                }
            }
            records
        }
    };

    for mut record in records {
        if let Some(obj) = record.as_object_mut() {
            if !obj.contains_key("confidence") {
                obj.insert("confidence".into(), ctx.base_confidence.into());
            }
        }
        match parse_candidate(record) {
            Ok(mut finding) => {
                if finding.sources.is_empty() {
                    finding.sources.push((&finding.tool).into());
                }
                output.findings.push(finding);
            }
            Err(violation) => output.rejected.push(violation),
        }
    }
    output
}
