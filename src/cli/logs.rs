//! Audit log viewer

use std::path::Path;

use anyhow::{Result, bail};

use testuniverse::audit::{AuditFilter, AuditLevel, read_events};

pub fn logs_command(path: &Path, level: Option<&str>, event: Option<String>, json: bool) -> Result<i32> {
    let min_level = match level {
        Some(raw) => match AuditLevel::from_str(raw) {
            Some(level) => Some(level),
            None => bail!("Unknown level '{}': expected debug, info, warn, error or critical", raw),
        },
        None => None,
    };
    let filter = AuditFilter {
        min_level,
        event,
        run_id: None,
    };

    let events = read_events(path, &filter)?;
    if events.is_empty() {
        println!("No matching audit records.");
        return Ok(0);
    }

    for record in &events {
        if json {
            println!("{}", serde_json::to_string(record)?);
            continue;
        }
        let payload = serde_json::Value::Object(record.payload.clone());
        println!(
            "{:>5} {} {:<8} {:<28} {}",
            record.seq,
            record.ts.format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level.as_str(),
            record.event,
            payload
        );
    }
    Ok(0)
}
