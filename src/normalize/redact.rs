//! Secrets redaction for evidence, descriptions and audit payloads

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::domain::Finding;

pub const REDACTION_MARKER: &str = "[REDACTED]";

struct SecretPattern {
    regex: Regex,
    /// Replacement template, `$name` keeps the matched key
    replacement: &'static str,
}

fn pattern(re: &str, replacement: &'static str) -> SecretPattern {
    SecretPattern {
        regex: Regex::new(re).expect("valid secret pattern"),
        replacement,
    }
}

static SECRET_PATTERNS: Lazy<Vec<SecretPattern>> = Lazy::new(|| {
    vec![
        pattern(
            r"(?s)-----BEGIN [A-Z ]*PRIVATE KEY-----.*?-----END [A-Z ]*PRIVATE KEY-----",
            "[REDACTED]",
        ),
        pattern(r"(?i)\b(?P<name>bearer|basic)\s+[A-Za-z0-9\-._~+/]{8,}=*", "$name [REDACTED]"),
        pattern(r"\beyJ[A-Za-z0-9_-]{5,}\.[A-Za-z0-9_-]{5,}\.[A-Za-z0-9_-]{5,}", "[REDACTED]"),
        pattern(r"\b(?:AKIA|ASIA)[0-9A-Z]{16}\b", "[REDACTED]"),
        pattern(r"\bgh[pousr]_[A-Za-z0-9]{30,}\b", "[REDACTED]"),
        pattern(r"\bxox[abprs]-[A-Za-z0-9-]{10,}\b", "[REDACTED]"),
        pattern(r"\bsk_(?:live|test)_[A-Za-z0-9]{16,}\b", "[REDACTED]"),
        pattern(
            r#"(?i)(?P<name>\b(?:password|passwd|pwd|secret|client_secret|api[_-]?key|apikey|access[_-]?token|refresh[_-]?token|auth[_-]?token|token|session[_-]?id|private[_-]?key)"?\s*[:=]\s*"?)[^\s"'&,;]{4,}"#,
            "${name}[REDACTED]",
        ),
        pattern(r"(?i)(?P<name>\b(?:set-)?cookie\s*:\s*)[^\r\n]+", "${name}[REDACTED]"),
    ]
});

static SENSITIVE_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(?:password|passwd|pwd|secret|client_secret|api[_-]?key|apikey|access[_-]?token|refresh[_-]?token|auth[_-]?token|token|authorization|cookie|set-cookie|private[_-]?key)$",
    )
    .expect("valid regex")
});

/// Replace every secret-looking substring. Returns the redacted text and how
/// many replacements were made.
pub fn redact_str(input: &str) -> (String, usize) {
    let mut out = input.to_string();
    let mut count = 0;
    for p in SECRET_PATTERNS.iter() {
        let hits = p
            .regex
            .find_iter(&out)
            .filter(|m| !m.as_str().ends_with(REDACTION_MARKER))
            .count();
        if hits > 0 {
            count += hits;
            out = p.regex.replace_all(&out, p.replacement).into_owned();
        }
    }
    (out, count)
}

fn redact_value_counting(value: Value, count: &mut usize) -> Value {
    match value {
        Value::String(s) => {
            let (redacted, n) = redact_str(&s);
            *count += n;
            Value::String(redacted)
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| redact_value_counting(v, count))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    let v = match v {
                        Value::String(s) if SENSITIVE_KEY.is_match(&k) && s != REDACTION_MARKER => {
                            *count += 1;
                            Value::String(REDACTION_MARKER.to_string())
                        }
                        other => redact_value_counting(other, count),
                    };
                    (k, v)
                })
                .collect(),
        ),
        other => other,
    }
}

/// Redact every string inside a JSON value, including values of sensitive keys
pub fn redact_json(value: Value) -> Value {
    let mut count = 0;
    redact_value_counting(value, &mut count)
}

fn redact_opt(field: &mut Option<String>, count: &mut usize) {
    if let Some(text) = field.as_mut() {
        let (redacted, n) = redact_str(text);
        if n > 0 {
            *count += n;
            *text = redacted;
        }
    }
}

/// Redact a finding in place before it is persisted anywhere.
/// Returns the number of replacements.
pub fn redact_finding(finding: &mut Finding) -> usize {
    let mut count = 0;
    redact_opt(&mut finding.description, &mut count);
    redact_opt(&mut finding.location.url, &mut count);
    for evidence in finding.evidence.iter_mut() {
        redact_opt(&mut evidence.description, &mut count);
        if let Some(content) = evidence.content.take() {
            evidence.content = Some(redact_value_counting(content, &mut count));
        }
    }
    let metadata = std::mem::take(&mut finding.metadata);
    finding.metadata = metadata
        .into_iter()
        .map(|(k, v)| {
            let v = match v {
                Value::String(_) if SENSITIVE_KEY.is_match(&k) => {
                    count += 1;
                    Value::String(REDACTION_MARKER.to_string())
                }
                other => redact_value_counting(other, &mut count),
            };
            (k, v)
        })
        .collect();
    count
}
