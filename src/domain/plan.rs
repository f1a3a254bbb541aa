//! Plan - which plugins run, their configuration and dependency edges

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Scan intensity preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    #[default]
    Ci,
    Quick,
    Deep,
    Stress,
}

impl ScanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanMode::Ci => "ci",
            ScanMode::Quick => "quick",
            ScanMode::Deep => "deep",
            ScanMode::Stress => "stress",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "ci" => Some(ScanMode::Ci),
            "quick" | "smoke" => Some(ScanMode::Quick),
            "deep" | "security" | "nightly" => Some(ScanMode::Deep),
            "stress" | "load" => Some(ScanMode::Stress),
            _ => None,
        }
    }

    /// Sustained request rate this mode runs at
    pub fn requests_per_second(&self) -> f64 {
        match self {
            ScanMode::Ci => 5.0,
            ScanMode::Quick => 20.0,
            ScanMode::Deep => 2.0,
            ScanMode::Stress => 100.0,
        }
    }

    /// Stress traffic is only permitted inside an approved Attack Mode session
    pub fn requires_attack_mode(&self) -> bool {
        matches!(self, ScanMode::Stress)
    }
}

impl std::fmt::Display for ScanMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

const MVP_WEBAPP: &[&str] = &["recon", "lighthouse", "axe", "zap-baseline", "security-headers"];
const MVP_SECURITY: &[&str] = &["recon", "zap-baseline", "security-headers", "nuclei"];
const MVP_PERFORMANCE: &[&str] = &["recon", "lighthouse", "k6"];

fn default_weight() -> f64 {
    1.0
}

fn default_parallel() -> bool {
    true
}

/// One plugin in a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawPlanEntry")]
pub struct PlanEntry {
    pub id: String,
    /// Hard dependencies: a failure here skips this entry
    pub depends_on: Vec<String>,
    /// Soft dependencies: ordering only, failures are tolerated
    pub soft_depends_on: Vec<String>,
    /// A mandatory plugin must produce at least one valid finding if it produced any output
    pub required: bool,
    /// Dispatch priority among ready nodes (higher first)
    pub weight: f64,
    pub config: BTreeMap<String, serde_json::Value>,
}

impl PlanEntry {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            depends_on: Vec::new(),
            soft_depends_on: Vec::new(),
            required: false,
            weight: default_weight(),
            config: BTreeMap::new(),
        }
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    pub fn soft_depends_on(mut self, id: impl Into<String>) -> Self {
        self.soft_depends_on.push(id.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPlanEntry {
    Id(String),
    Full {
        id: String,
        #[serde(default)]
        depends_on: Vec<String>,
        #[serde(default)]
        soft_depends_on: Vec<String>,
        #[serde(default)]
        required: bool,
        #[serde(default = "default_weight")]
        weight: f64,
        #[serde(default)]
        config: BTreeMap<String, serde_json::Value>,
    },
}

impl From<RawPlanEntry> for PlanEntry {
    fn from(raw: RawPlanEntry) -> Self {
        match raw {
            RawPlanEntry::Id(id) => PlanEntry::new(id),
            RawPlanEntry::Full {
                id,
                depends_on,
                soft_depends_on,
                required,
                weight,
                config,
            } => PlanEntry {
                id,
                depends_on,
                soft_depends_on,
                required,
                weight,
                config,
            },
        }
    }
}

/// Selected plugins, their configuration and dependency graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pack: Option<String>,

    #[serde(default)]
    pub mode: ScanMode,

    #[serde(default)]
    pub plugins: Vec<PlanEntry>,

    #[serde(default = "default_parallel")]
    pub parallel: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,

    /// Overrides the policy timebox when smaller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timebox_seconds: Option<u64>,

    /// Per-plugin configuration, merged under each entry's own `config`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub plugin_config: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

impl Default for Plan {
    fn default() -> Self {
        Self {
            pack: None,
            mode: ScanMode::default(),
            plugins: Vec::new(),
            parallel: default_parallel(),
            max_workers: None,
            timebox_seconds: None,
            plugin_config: BTreeMap::new(),
        }
    }
}

impl Plan {
    /// Plugin ids of a predefined pack
    pub fn pack_plugins(pack: &str) -> Option<&'static [&'static str]> {
        match pack {
            "mvp-webapp" => Some(MVP_WEBAPP),
            "mvp-security" => Some(MVP_SECURITY),
            "mvp-performance" => Some(MVP_PERFORMANCE),
            _ => None,
        }
    }

    pub fn from_plugins<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            plugins: ids.into_iter().map(PlanEntry::new).collect(),
            ..Default::default()
        }
    }

    /// Expand `pack` into plugin entries. Explicit entries win over pack entries
    /// with the same id.
    pub fn expand_pack(&mut self) -> Result<(), String> {
        let Some(pack) = self.pack.clone() else {
            return Ok(());
        };
        let ids = Self::pack_plugins(&pack).ok_or_else(|| format!("unknown pack '{}'", pack))?;
        let mut expanded: Vec<PlanEntry> = Vec::new();
        for id in ids {
            if !self.plugins.iter().any(|p| p.id == *id) {
                expanded.push(PlanEntry::new(*id));
            }
        }
        expanded.append(&mut self.plugins);
        self.plugins = expanded;
        Ok(())
    }

    pub fn entry(&self, id: &str) -> Option<&PlanEntry> {
        self.plugins.iter().find(|p| p.id == id)
    }

    /// Configuration for one plugin: `plugin_config` overlaid by the entry's own config
    pub fn config_for(&self, id: &str) -> BTreeMap<String, serde_json::Value> {
        let mut config = self.plugin_config.get(id).cloned().unwrap_or_default();
        if let Some(entry) = self.entry(id) {
            for (k, v) in &entry.config {
                config.insert(k.clone(), v.clone());
            }
        }
        config
    }

    /// Effective worker count given a kernel default
    pub fn workers(&self, default_workers: usize) -> usize {
        if !self.parallel {
            return 1;
        }
        self.max_workers.unwrap_or(default_workers).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_accept_ids_and_full_form() {
        let yaml = r#"
mode: quick
plugins:
  - recon
  - id: zap-baseline
    depends_on: [recon]
    required: true
    config:
      ajax_spider: true
max_workers: 4
plugin_config:
  zap-baseline:
    max_duration: 300
    ajax_spider: false
"#;
        let plan: Plan = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(plan.mode, ScanMode::Quick);
        assert_eq!(plan.plugins.len(), 2);
        assert_eq!(plan.plugins[0], PlanEntry::new("recon"));
        assert!(plan.plugins[1].required);
        assert_eq!(plan.plugins[1].depends_on, vec!["recon".to_string()]);
        assert!(plan.parallel);

        let config = plan.config_for("zap-baseline");
        assert_eq!(config["ajax_spider"], serde_json::json!(true));
        assert_eq!(config["max_duration"], serde_json::json!(300));
    }

    #[test]
    fn pack_expansion_keeps_explicit_entries() {
        let mut plan = Plan {
            pack: Some("mvp-webapp".into()),
            plugins: vec![PlanEntry::new("axe").required()],
            ..Default::default()
        };
        plan.expand_pack().unwrap();
        let ids: Vec<&str> = plan.plugins.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["recon", "lighthouse", "zap-baseline", "security-headers", "axe"]);
        assert!(plan.entry("axe").unwrap().required);

        let mut unknown = Plan {
            pack: Some("nope".into()),
            ..Default::default()
        };
        assert!(unknown.expand_pack().is_err());
    }

    #[test]
    fn mode_presets() {
        assert_eq!(ScanMode::from_str("security"), Some(ScanMode::Deep));
        assert_eq!(ScanMode::Ci.requests_per_second(), 5.0);
        assert_eq!(ScanMode::Stress.requests_per_second(), 100.0);
        assert!(ScanMode::Stress.requires_attack_mode());
        assert!(!ScanMode::Deep.requires_attack_mode());
    }

    #[test]
    fn sequential_plan_uses_one_worker() {
        let mut plan = Plan::from_plugins(["a", "b"]);
        assert_eq!(plan.workers(4), 4);
        plan.parallel = false;
        assert_eq!(plan.workers(4), 1);
    }
}
