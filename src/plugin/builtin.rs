//! Built-in plugin catalogue
//!
//! Every built-in is manifest data. The tools themselves ship in their
//! images; the `*-report` helpers inside those images translate tool output
//! into one of the supported output formats.

use super::{PluginError, PluginManifest};

const RECON: &str = r#"
id: recon
name: Recon Crawler
version: 1.0.0
author: TestUniverse
tool:
  name: katana
  version: ">=1.0"
  install: "go install github.com/projectdiscovery/katana/cmd/katana@latest"
capabilities:
  target_types: [web, api]
  families: [security, performance, accessibility, api, functional]
  evidence_types: [urls]
  traffic: passive
resources:
  memory_mb: 256
  timeout_seconds: 300
execution:
  image: projectdiscovery/katana:latest
  command: ["katana", "-u", "{target_url}", "-d", "{config.depth}", "-rl", "{rate_limit}",
            "-silent", "-o", "{output_dir}/urls.txt"]
  output_files: [urls.txt]
  unreachable_exit_codes: [2]
  defaults:
    depth: 3
base_confidence: 0.5
"#;

const LIGHTHOUSE: &str = r#"
id: lighthouse
name: Lighthouse
version: 1.0.0
author: TestUniverse
tool:
  name: lighthouse
  version: ">=11.0"
  install: "npm install -g lighthouse"
capabilities:
  target_types: [web]
  families: [performance, accessibility]
  evidence_types: [json, screenshot]
  traffic: passive
resources:
  memory_mb: 1024
  timeout_seconds: 600
dependencies: [recon]
execution:
  image: testuniverse/lighthouse:12
  command: ["lighthouse-report", "--urls", "{seed_urls_file}", "--preset", "{config.preset}",
            "--categories", "{config.categories}", "--out", "{output_dir}/issues.json"]
  output_files: [issues.json]
  output_format: issues
  unreachable_exit_codes: [69]
  defaults:
    preset: mobile
    categories: [performance, accessibility, best-practices, seo]
base_confidence: 0.85
"#;

const AXE: &str = r#"
id: axe
name: Axe Accessibility
version: 1.0.0
author: TestUniverse
tool:
  name: axe-core
  version: ">=4.8"
  install: "npm install -g @axe-core/cli"
capabilities:
  target_types: [web]
  families: [accessibility]
  evidence_types: [json, html]
  traffic: passive
resources:
  memory_mb: 768
  timeout_seconds: 600
dependencies: [recon]
execution:
  image: testuniverse/axe:4
  command: ["axe-report", "--urls", "{seed_urls_file}", "--tags", "{config.wcag_levels}",
            "--out", "{output_dir}/issues.json"]
  output_files: [issues.json]
  output_format: issues
  unreachable_exit_codes: [69]
  defaults:
    wcag_levels: [wcag2a, wcag2aa]
base_confidence: 0.9
"#;

const ZAP_BASELINE: &str = r#"
id: zap-baseline
name: OWASP ZAP Baseline
version: 1.0.0
author: TestUniverse
tool:
  name: zap
  version: ">=2.14"
  install: "docker pull ghcr.io/zaproxy/zaproxy:stable"
capabilities:
  target_types: [web, api]
  families: [security]
  evidence_types: [har, json]
  traffic: passive
resources:
  memory_mb: 2048
  timeout_seconds: 900
execution:
  image: testuniverse/zap:stable
  command: ["zap-report", "--mode", "baseline", "--target", "{target_url}",
            "--seeds", "{seed_urls_file}", "--minutes", "{config.spider_minutes}",
            "--sarif", "{output_dir}/zap.sarif", "--status-log", "{output_dir}/status.log"]
  output_files: [zap.sarif]
  output_format: sarif
  telemetry_file: status.log
  success_exit_codes: [0, 1, 2]
  unreachable_exit_codes: [3]
  defaults:
    spider_minutes: 1
base_confidence: 0.7
"#;

const ZAP_FULL: &str = r#"
id: zap-full
name: OWASP ZAP Full Scan
version: 1.0.0
author: TestUniverse
tool:
  name: zap
  version: ">=2.14"
  install: "docker pull ghcr.io/zaproxy/zaproxy:stable"
capabilities:
  target_types: [web, api]
  families: [security]
  evidence_types: [har, json]
  traffic: active
resources:
  memory_mb: 3072
  timeout_seconds: 3600
execution:
  image: testuniverse/zap:stable
  command: ["zap-report", "--mode", "full", "--target", "{target_url}",
            "--seeds", "{seed_urls_file}", "--strength", "{config.strength}",
            "--sarif", "{output_dir}/zap.sarif", "--status-log", "{output_dir}/status.log"]
  output_files: [zap.sarif]
  output_format: sarif
  telemetry_file: status.log
  success_exit_codes: [0, 1, 2]
  unreachable_exit_codes: [3]
  defaults:
    strength: medium
base_confidence: 0.75
"#;

const SECURITY_HEADERS: &str = r#"
id: security-headers
name: Security Headers
version: 1.0.0
author: TestUniverse
tool:
  name: header-check
  version: ">=1.0"
capabilities:
  target_types: [web, api]
  families: [security]
  evidence_types: [http]
  traffic: passive
resources:
  memory_mb: 128
  timeout_seconds: 120
execution:
  image: testuniverse/security-headers:1
  command: ["header-check", "--url", "{target_url}", "--format", "findings",
            "--out", "{output_dir}/findings.json"]
  output_files: [findings.json]
  output_format: native
  unreachable_exit_codes: [7]
base_confidence: 0.95
"#;

const K6: &str = r#"
id: k6
name: k6 Load Test
version: 1.0.0
author: TestUniverse
tool:
  name: k6
  version: ">=0.50"
  install: "brew install k6"
capabilities:
  target_types: [web, api]
  families: [performance]
  evidence_types: [json]
  traffic: passive
resources:
  memory_mb: 1024
  timeout_seconds: 900
execution:
  image: testuniverse/k6:0.50
  command: ["k6-report", "--target", "{target_url}", "--vus", "{config.vus}",
            "--duration", "{config.duration}", "--p95-ms", "{config.p95_ms}",
            "--out", "{output_dir}/issues.json", "--status-log", "{output_dir}/status.log"]
  output_files: [issues.json]
  output_format: issues
  telemetry_file: status.log
  success_exit_codes: [0, 99]
  unreachable_exit_codes: [107]
  defaults:
    vus: 10
    duration: 2m
    p95_ms: 500
base_confidence: 0.8
"#;

const NUCLEI: &str = r#"
id: nuclei
name: Nuclei
version: 1.0.0
author: TestUniverse
tool:
  name: nuclei
  version: ">=3.0"
  install: "go install github.com/projectdiscovery/nuclei/v3/cmd/nuclei@latest"
capabilities:
  target_types: [web, api, infra]
  families: [security]
  evidence_types: [http, curl]
  traffic: passive
resources:
  memory_mb: 1024
  timeout_seconds: 1800
dependencies: [recon]
execution:
  image: projectdiscovery/nuclei:latest
  command: ["nuclei", "-list", "{seed_urls_file}", "-jsonl", "-o", "{output_dir}/nuclei.jsonl",
            "-rl", "{rate_limit}", "-severity", "{config.severity}", "-silent", "-disable-update-check"]
  output_files: [nuclei.jsonl]
  output_format: nuclei
  defaults:
    severity: [critical, high, medium, low, info]
base_confidence: 0.7
"#;

const CATALOGUE: [(&str, &str); 8] = [
    ("recon", RECON),
    ("lighthouse", LIGHTHOUSE),
    ("axe", AXE),
    ("zap-baseline", ZAP_BASELINE),
    ("zap-full", ZAP_FULL),
    ("security-headers", SECURITY_HEADERS),
    ("k6", K6),
    ("nuclei", NUCLEI),
];

pub const BUILTIN_PLUGIN_IDS: [&str; 8] = [
    "recon",
    "lighthouse",
    "axe",
    "zap-baseline",
    "zap-full",
    "security-headers",
    "k6",
    "nuclei",
];

/// Parse the built-in manifests
pub fn builtin_manifests() -> Result<Vec<PluginManifest>, PluginError> {
    CATALOGUE
        .iter()
        .map(|(id, yaml)| PluginManifest::from_yaml(yaml, &format!("builtin:{}", id)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TrafficClass;

    #[test]
    fn every_builtin_manifest_is_valid() {
        let manifests = builtin_manifests().unwrap();
        let ids: Vec<&str> = manifests.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, BUILTIN_PLUGIN_IDS);
        for (manifest, (id, _)) in manifests.iter().zip(CATALOGUE.iter()) {
            assert_eq!(manifest.id, *id);
            assert!(manifest.problems().is_empty(), "{}: {:?}", id, manifest.problems());
        }
    }

    #[test]
    fn only_the_full_zap_scan_is_active() {
        let active: Vec<String> = builtin_manifests()
            .unwrap()
            .into_iter()
            .filter(|m| m.capabilities.traffic == TrafficClass::Active)
            .map(|m| m.id)
            .collect();
        assert_eq!(active, vec!["zap-full"]);
    }
}
