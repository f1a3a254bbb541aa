//! Quality gate thresholds, results and the deterministic exit-code table

use serde::{Deserialize, Serialize};

use super::Severity;

/// Process exit codes. The numeric values are a public contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitCode {
    Pass,
    GateFail,
    AuthBlocked,
    InternalError,
    Timeout,
    TargetUnreachable,
}

impl ExitCode {
    pub fn code(&self) -> i32 {
        match self {
            ExitCode::Pass => 0,
            ExitCode::GateFail => 1,
            ExitCode::AuthBlocked => 2,
            ExitCode::InternalError => 3,
            ExitCode::Timeout => 4,
            ExitCode::TargetUnreachable => 5,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExitCode::Pass => "PASS",
            ExitCode::GateFail => "GATE_FAIL",
            ExitCode::AuthBlocked => "AUTH_BLOCKED",
            ExitCode::InternalError => "INTERNAL_ERROR",
            ExitCode::Timeout => "TIMEOUT",
            ExitCode::TargetUnreachable => "TARGET_UNREACHABLE",
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(ExitCode::Pass),
            1 => Some(ExitCode::GateFail),
            2 => Some(ExitCode::AuthBlocked),
            3 => Some(ExitCode::InternalError),
            4 => Some(ExitCode::Timeout),
            5 => Some(ExitCode::TargetUnreachable),
            _ => None,
        }
    }

    /// Precedence when several outcomes apply to one run (higher wins)
    fn precedence(&self) -> u8 {
        match self {
            ExitCode::AuthBlocked => 5,
            ExitCode::TargetUnreachable => 4,
            ExitCode::InternalError => 3,
            ExitCode::Timeout => 2,
            ExitCode::GateFail => 1,
            ExitCode::Pass => 0,
        }
    }

    /// Combine two classifications, keeping the one with higher precedence
    pub fn worst(self, other: ExitCode) -> ExitCode {
        if other.precedence() > self.precedence() {
            other
        } else {
            self
        }
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

/// Maximum allowed count per severity. `None` means no threshold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateThresholds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medium: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<u32>,
}

impl GateThresholds {
    pub fn get(&self, severity: Severity) -> Option<u32> {
        match severity {
            Severity::Critical => self.critical,
            Severity::High => self.high,
            Severity::Medium => self.medium,
            Severity::Low => self.low,
            Severity::Info => self.info,
        }
    }

    pub fn set(&mut self, severity: Severity, value: Option<u32>) {
        let slot = match severity {
            Severity::Critical => &mut self.critical,
            Severity::High => &mut self.high,
            Severity::Medium => &mut self.medium,
            Severity::Low => &mut self.low,
            Severity::Info => &mut self.info,
        };
        *slot = value;
    }

    pub fn is_empty(&self) -> bool {
        Severity::ALL.iter().all(|s| self.get(*s).is_none())
    }

    /// Parse the CLI shorthand `critical=0,high=3` (`high=null` clears a threshold)
    pub fn parse(spec: &str) -> Result<Self, String> {
        let mut thresholds = GateThresholds::default();
        for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, value) = part
                .split_once('=')
                .ok_or_else(|| format!("invalid gate entry '{}', expected severity=count", part))?;
            let severity = Severity::from_str(name)
                .ok_or_else(|| format!("unknown severity '{}' in gate", name.trim()))?;
            let value = value.trim();
            let parsed = if value.eq_ignore_ascii_case("null") || value.is_empty() {
                None
            } else {
                Some(
                    value
                        .parse::<u32>()
                        .map_err(|_| format!("invalid threshold '{}' for {}", value, severity))?,
                )
            };
            thresholds.set(severity, parsed);
        }
        Ok(thresholds)
    }

    /// Apply every threshold set in `other` on top of `self`
    pub fn overlay(&mut self, other: &GateThresholds) {
        for severity in Severity::ALL {
            if let Some(v) = other.get(severity) {
                self.set(severity, Some(v));
            }
        }
    }
}

/// Finding counts per severity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
    pub info: u32,
}

impl SeverityCounts {
    pub fn get(&self, severity: Severity) -> u32 {
        match severity {
            Severity::Critical => self.critical,
            Severity::High => self.high,
            Severity::Medium => self.medium,
            Severity::Low => self.low,
            Severity::Info => self.info,
        }
    }

    pub fn increment(&mut self, severity: Severity) {
        match severity {
            Severity::Critical => self.critical += 1,
            Severity::High => self.high += 1,
            Severity::Medium => self.medium += 1,
            Severity::Low => self.low += 1,
            Severity::Info => self.info += 1,
        }
    }

    pub fn total(&self) -> u32 {
        Severity::ALL.iter().map(|s| self.get(*s)).sum()
    }
}

/// Outcome of quality gate evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub passed: bool,
    pub thresholds: GateThresholds,
    pub actual: SeverityCounts,
    pub violations: Vec<String>,
    pub exit_code: i32,
    pub exit_reason: ExitCode,
}
