//! Side-channel artifacts a plugin may emit next to its findings

use crate::domain::ExecutionResult;

/// Discovered URLs, one per line, handed to dependent jobs after scope checks
pub const DISCOVERED_URLS_ARTIFACT: &str = "urls.txt";

/// One observed HTTP response in a telemetry file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusObservation {
    pub status: u16,
    pub url: Option<String>,
}

/// Parse a URL list: blank lines and `#` comments are ignored, repeats dropped
pub fn parse_url_list(text: &str) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if !urls.iter().any(|u| u == line) {
            urls.push(line.to_string());
        }
    }
    urls
}

/// URLs a finished job discovered, if it wrote a URL list
pub fn discovered_urls(result: &ExecutionResult) -> Vec<String> {
    result
        .artifact(DISCOVERED_URLS_ARTIFACT)
        .map(|a| parse_url_list(&a.text()))
        .unwrap_or_default()
}

/// Parse telemetry lines of the form `<status> [url]`. Lines that do not start
/// with a valid HTTP status are skipped.
pub fn parse_telemetry(text: &str) -> Vec<StatusObservation> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let status: u16 = parts.next()?.parse().ok()?;
            if !(100..=599).contains(&status) {
                return None;
            }
            Some(StatusObservation {
                status,
                url: parts.next().map(str::to_string),
            })
        })
        .collect()
}

/// Status observations from a job's declared telemetry file
pub fn telemetry(result: &ExecutionResult, telemetry_file: Option<&str>) -> Vec<StatusObservation> {
    telemetry_file
        .and_then(|name| result.artifact(name))
        .map(|a| parse_telemetry(&a.text()))
        .unwrap_or_default()
}
