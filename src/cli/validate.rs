//! Finding schema validation

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde_json::Value;

use testuniverse::normalize::parse_finding;

/// Accepts a single finding, an array, or `{"findings": [...]}`
fn collect_records(value: Value) -> Result<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(mut obj) => match obj.remove("findings") {
            Some(Value::Array(items)) => Ok(items),
            Some(_) => bail!("\"findings\" must be an array"),
            None => Ok(vec![Value::Object(obj)]),
        },
        _ => bail!("Expected a finding object or an array of findings"),
    }
}

pub fn validate_command(path: &Path) -> Result<i32> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value: Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    let records = collect_records(value)?;

    let mut invalid = 0;
    for (idx, record) in records.into_iter().enumerate() {
        match parse_finding(record) {
            Ok(finding) => println!("  ok      #{} {} ({})", idx, finding.finding_id, finding.severity),
            Err(violation) => {
                invalid += 1;
                println!("  invalid #{} [{}] {}", idx, violation.code(), violation);
            }
        }
    }

    if invalid == 0 {
        println!("All findings conform to the schema.");
        Ok(0)
    } else {
        println!("{} finding(s) rejected.", invalid);
        Ok(1)
    }
}
