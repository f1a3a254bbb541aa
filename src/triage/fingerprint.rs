//! Stable finding identity and the normalization helpers dedupe relies on

use url::Url;

use crate::domain::Finding;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a
fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME)
    })
}

/// Lower-cased title with runs of whitespace collapsed to one space
pub fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Canonical form of a URL for comparison.
///
/// Scheme and host are lower-cased, default ports dropped, query and
/// fragment removed and a trailing slash trimmed. Strings that do not parse
/// as URLs only lose their query, fragment and trailing slash.
pub fn normalize_url(raw: &str) -> String {
    let raw = raw.trim();
    match Url::parse(raw) {
        Ok(url) if url.has_host() => {
            let mut out = format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default());
            // `port()` is None when the port is the scheme default
            if let Some(port) = url.port() {
                out.push_str(&format!(":{}", port));
            }
            out.push_str(url.path().trim_end_matches('/'));
            out
        }
        _ => {
            let end = raw.find(['?', '#']).unwrap_or(raw.len());
            raw[..end].trim_end_matches('/').to_string()
        }
    }
}

/// Normalized location used both for dedupe keys and fingerprints
pub fn location_key(finding: &Finding) -> String {
    let loc = &finding.location;
    match (&loc.url, &loc.file) {
        (Some(url), _) => normalize_url(url),
        (None, Some(file)) => match loc.line {
            Some(line) => format!("{}:{}", file, line),
            None => file.clone(),
        },
        (None, None) => String::new(),
    }
}

pub fn parameter_key(finding: &Finding) -> String {
    finding
        .location
        .parameter
        .as_deref()
        .map(|p| p.trim().to_lowercase())
        .unwrap_or_default()
}

/// Tool-independent identity of a finding: the same issue reported by two
/// tools, or by the same tool in two runs, yields the same fingerprint.
pub fn fingerprint(finding: &Finding) -> String {
    let material = [
        finding.family.as_str().to_string(),
        finding.category.trim().to_lowercase(),
        location_key(finding),
        parameter_key(finding),
        normalize_title(&finding.title),
    ]
    .join("\u{1f}");
    format!("fp_{:016x}", fnv1a(material.as_bytes()))
}
