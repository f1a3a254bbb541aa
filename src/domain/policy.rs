//! Policy - quality thresholds, scope and rate constraints governing a run

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Family, GateThresholds, ScanMode, Severity};

/// Attack categories that can never be requested, whatever the policy says
pub const ALWAYS_FORBIDDEN_ATTACKS: [&str; 3] = ["dos", "data_destruction", "ransomware_simulation"];

pub const MIN_TIMEBOX_SECONDS: u64 = 60;
pub const MAX_TIMEBOX_SECONDS: u64 = 86_400;

fn default_confidence_threshold() -> f64 {
    0.5
}

fn default_timebox_seconds() -> u64 {
    3600
}

fn default_families() -> Vec<Family> {
    Family::ALL.to_vec()
}

/// Per-host adaptive rate limit configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Sustained rate ceiling
    pub requests_per_second: f64,
    /// Bucket capacity
    pub burst: u32,
    /// Maximum requests in flight per host
    pub max_concurrent: u32,
    /// Minimum spacing between admissions
    pub delay_ms: u64,
    /// Path prefix -> requests per second
    pub per_endpoint: BTreeMap<String, f64>,
    pub cooldown_429_secs: u64,
    pub pause_503_secs: u64,
    /// Error-free time required before each additive increase
    pub recovery_window_secs: u64,
    /// Requests per second added per recovery window
    pub recovery_step: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10.0,
            burst: 20,
            max_concurrent: 5,
            delay_ms: 0,
            per_endpoint: BTreeMap::new(),
            cooldown_429_secs: 30,
            pause_503_secs: 60,
            recovery_window_secs: 30,
            recovery_step: 1.0,
        }
    }
}

/// Attack Mode gates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttackModeConfig {
    pub enabled: bool,
    pub require_approval: bool,
    /// Env var holding a pre-approved signed token for non-interactive approval
    pub pre_approved_token_env: String,
    pub max_duration_hours: u32,
    pub allowed_attacks: Vec<String>,
    pub forbidden_attacks: Vec<String>,
}

impl Default for AttackModeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            require_approval: true,
            pre_approved_token_env: "TESTUNIVERSE_ATTACK_TOKEN".to_string(),
            max_duration_hours: 2,
            allowed_attacks: Vec::new(),
            forbidden_attacks: Vec::new(),
        }
    }
}

impl AttackModeConfig {
    /// Configured forbidden attacks plus the ones that are always forbidden
    pub fn effective_forbidden(&self) -> Vec<String> {
        let mut out: Vec<String> = ALWAYS_FORBIDDEN_ATTACKS.iter().map(|s| s.to_string()).collect();
        for attack in &self.forbidden_attacks {
            let attack = attack.to_lowercase();
            if !out.contains(&attack) {
                out.push(attack);
            }
        }
        out
    }

    pub fn is_forbidden(&self, attack: &str) -> bool {
        let attack = attack.to_lowercase();
        self.effective_forbidden().iter().any(|f| *f == attack)
    }
}

/// Confidence scoring adjustments
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceWeights {
    pub reproduction: f64,
    pub evidence: f64,
    pub history: f64,
    pub flaky_history: f64,
    pub intermittent: f64,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            reproduction: 0.15,
            evidence: 0.10,
            history: 0.05,
            flaky_history: -0.30,
            intermittent: -0.20,
        }
    }
}

/// Triage tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriageConfig {
    /// Jaro-Winkler similarity above which two titles describe the same issue
    pub similarity_threshold: f64,
    pub weights: ConfidenceWeights,
    /// Verification reruns per plugin that produced findings
    pub verify_reruns: u32,
    /// Runs a fingerprint must have been seen in to count as a known pattern
    pub history_min_runs: u32,
    /// Flaky runs before the flaky-history penalty applies
    pub flaky_min_runs: u32,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.85,
            weights: ConfidenceWeights::default(),
            verify_reruns: 0,
            history_min_runs: 2,
            flaky_min_runs: 1,
        }
    }
}

/// Loaded once per run and read-only during execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub gate: GateThresholds,

    #[serde(default)]
    pub new_findings_only: bool,

    /// Overrides `confidence_threshold` for gate counting when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_confidence: Option<f64>,

    #[serde(default = "default_families")]
    pub families: Vec<Family>,

    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Findings below this severity are dropped from the report
    #[serde(default)]
    pub severity_threshold: Severity,

    #[serde(default = "default_timebox_seconds")]
    pub timebox_seconds: u64,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub attack_mode: AttackModeConfig,

    #[serde(default)]
    pub triage: TriageConfig,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            name: None,
            gate: GateThresholds::default(),
            new_findings_only: false,
            min_confidence: None,
            families: default_families(),
            confidence_threshold: default_confidence_threshold(),
            severity_threshold: Severity::Info,
            timebox_seconds: default_timebox_seconds(),
            rate_limit: RateLimitConfig::default(),
            attack_mode: AttackModeConfig::default(),
            triage: TriageConfig::default(),
        }
    }
}

impl Policy {
    pub fn with_gate(mut self, gate: GateThresholds) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_timebox(mut self, seconds: u64) -> Self {
        self.timebox_seconds = seconds;
        self
    }

    /// Confidence floor used when counting findings against the gate
    pub fn gate_confidence(&self) -> f64 {
        self.min_confidence.unwrap_or(self.confidence_threshold)
    }

    /// Rate limit for a scan mode. The mode preset caps the configured rate;
    /// stress mode replaces it, since it only runs inside Attack Mode.
    pub fn rate_limit_for(&self, mode: ScanMode) -> RateLimitConfig {
        let mut config = self.rate_limit.clone();
        config.requests_per_second = if mode.requires_attack_mode() {
            mode.requests_per_second()
        } else {
            config.requests_per_second.min(mode.requests_per_second())
        };
        config
    }

    pub fn covers_family(&self, family: Family) -> bool {
        self.families.contains(&family)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(MIN_TIMEBOX_SECONDS..=MAX_TIMEBOX_SECONDS).contains(&self.timebox_seconds) {
            return Err(format!(
                "timebox_seconds must be between {} and {}, got {}",
                MIN_TIMEBOX_SECONDS, MAX_TIMEBOX_SECONDS, self.timebox_seconds
            ));
        }
        for (name, value) in [
            ("confidence_threshold", Some(self.confidence_threshold)),
            ("min_confidence", self.min_confidence),
            ("triage.similarity_threshold", Some(self.triage.similarity_threshold)),
        ] {
            if let Some(v) = value {
                if !(0.0..=1.0).contains(&v) {
                    return Err(format!("{} must be within [0, 1], got {}", name, v));
                }
            }
        }
        if self.families.is_empty() {
            return Err("policy must enable at least one family".to_string());
        }
        let rl = &self.rate_limit;
        if rl.requests_per_second <= 0.0 || rl.burst == 0 || rl.max_concurrent == 0 {
            return Err(
                "rate_limit requests_per_second, burst and max_concurrent must be positive"
                    .to_string(),
            );
        }
        for attack in &self.attack_mode.allowed_attacks {
            if self.attack_mode.is_forbidden(attack) {
                return Err(format!("attack '{}' is forbidden and cannot be allowed", attack));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let policy: Policy = serde_yaml::from_str("gate:\n  critical: 0\n  high: 3\n").unwrap();
        assert_eq!(policy.gate.high, Some(3));
        assert_eq!(policy.families.len(), 5);
        assert_eq!(policy.timebox_seconds, 3600);
        assert_eq!(policy.rate_limit.max_concurrent, 5);
        assert!((policy.triage.similarity_threshold - 0.85).abs() < f64::EPSILON);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn min_confidence_overrides_threshold_for_gate() {
        let mut policy = Policy::default();
        assert!((policy.gate_confidence() - 0.5).abs() < f64::EPSILON);
        policy.min_confidence = Some(0.8);
        assert!((policy.gate_confidence() - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn scan_mode_caps_rate() {
        let policy = Policy::default();
        assert_eq!(policy.rate_limit_for(ScanMode::Ci).requests_per_second, 5.0);
        assert_eq!(policy.rate_limit_for(ScanMode::Quick).requests_per_second, 10.0);
        assert_eq!(policy.rate_limit_for(ScanMode::Stress).requests_per_second, 100.0);
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(Policy::default().with_timebox(30).validate().is_err());
        assert!(Policy::default().with_timebox(90_000).validate().is_err());

        let mut policy = Policy::default();
        policy.confidence_threshold = 1.5;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn always_forbidden_attacks_cannot_be_allowed() {
        let mut policy = Policy::default();
        policy.attack_mode.allowed_attacks = vec!["sqli".into(), "DoS".into()];
        let err = policy.validate().unwrap_err();
        assert!(err.contains("DoS"));
        assert!(policy.attack_mode.is_forbidden("ransomware_simulation"));
        assert!(!policy.attack_mode.is_forbidden("sqli"));
    }
}
