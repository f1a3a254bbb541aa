//! YAML run files and policy inheritance.
//!
//! A run file carries up to three top-level sections:
//!
//! ```yaml
//! target:
//!   id: shop
//!   type: web
//!   url: https://staging.shop.example
//! policy:
//!   extends: ../policies/base.yaml
//!   gate: {critical: 0, high: 3}
//! plan:
//!   pack: mvp-webapp
//!   mode: ci
//! ```
//!
//! Any section may also live in a file of its own; [`RunConfig::merge`]
//! combines them, later files winning section by section.
//!
//! # Inheritance
//!
//! `policy.extends` names a base policy file, resolved relative to the file
//! that references it. Bases may extend further bases up to
//! [`MAX_EXTENDS_DEPTH`] levels. The child's gate entries override the base
//! per severity, families are unioned, nested sections merge key by key and
//! every other field is replaced by the child's value.

use std::path::{Path, PathBuf};

use serde_yaml::Value;

use super::ConfigError;
use crate::domain::{Plan, Policy, Target, TargetType};

pub const MAX_EXTENDS_DEPTH: usize = 8;

const EXTENDS_KEY: &str = "extends";

/// Target, policy and plan as loaded from run files
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    pub target: Option<Target>,
    pub policy: Option<Policy>,
    pub plan: Option<Plan>,
}

impl RunConfig {
    /// Section-wise merge; sections present in `other` replace ours
    pub fn merge(self, other: RunConfig) -> RunConfig {
        RunConfig {
            target: other.target.or(self.target),
            policy: other.policy.or(self.policy),
            plan: other.plan.or(self.plan),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let root = read_yaml(path)?;
        let base_dir = parent_dir(path);

        let Value::Mapping(mut map) = root else {
            return Err(parse_error(path, "run file must be a mapping"));
        };

        let target = match map.remove("target") {
            Some(v) => {
                let target: Target = from_value(v, path, "target")?;
                target.validate().map_err(ConfigError::Invalid)?;
                Some(target)
            }
            None => None,
        };
        let policy = match map.remove("policy") {
            Some(v) => {
                let mut chain = vec![canonical(path)];
                let resolved = resolve_policy(v, &base_dir, &mut chain)?;
                Some(policy_from_value(resolved, path)?)
            }
            None => None,
        };
        let plan = match map.remove("plan") {
            Some(v) => {
                let mut plan: Plan = from_value(v, path, "plan")?;
                plan.expand_pack().map_err(ConfigError::Invalid)?;
                Some(plan)
            }
            None => None,
        };

        if target.is_none() && policy.is_none() && plan.is_none() {
            return Err(parse_error(
                path,
                "expected at least one of the sections target, policy, plan",
            ));
        }
        for key in map.keys().filter_map(Value::as_str) {
            tracing::warn!("Ignoring unknown section '{}' in {}", key, path.display());
        }

        Ok(Self { target, policy, plan })
    }
}

/// Load a standalone policy file (either a bare policy or a `policy:` section)
pub fn load_policy_file(path: &Path) -> Result<Policy, ConfigError> {
    let mut chain = Vec::new();
    let resolved = resolve_policy_file(path, &mut chain)?;
    policy_from_value(resolved, path)
}

/// Build a web target from a bare URL given on the command line
pub fn target_from_url(raw: &str) -> Result<Target, ConfigError> {
    let url = url::Url::parse(raw.trim())
        .map_err(|e| ConfigError::Invalid(format!("'{}' is not a valid URL: {}", raw, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| ConfigError::Invalid(format!("URL '{}' has no host", raw)))?;

    let mut id = String::with_capacity(host.len());
    for c in host.to_ascii_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            id.push(c);
        } else if !id.ends_with('-') {
            id.push('-');
        }
    }
    let id = id.trim_matches('-').to_string();

    let target = Target::new(id, TargetType::Web, url.as_str());
    target.validate().map_err(ConfigError::Invalid)?;
    Ok(target)
}

/// Merge a child policy document over its base
pub fn merge_policy(base: Value, child: Value) -> Value {
    let (Value::Mapping(mut base), Value::Mapping(child)) = (base, child) else {
        return Value::Null;
    };
    for (key, value) in child {
        let merged = match (key.as_str(), base.remove(&key)) {
            (Some("families"), Some(existing)) => union_sequences(existing, value),
            (_, Some(existing @ Value::Mapping(_))) if value.is_mapping() => merge_mappings(existing, value),
            _ => value,
        };
        base.insert(key, merged);
    }
    Value::Mapping(base)
}

fn merge_mappings(base: Value, child: Value) -> Value {
    match (base, child) {
        (Value::Mapping(mut base), Value::Mapping(child)) => {
            for (key, value) in child {
                let merged = match base.remove(&key) {
                    Some(existing @ Value::Mapping(_)) if value.is_mapping() => {
                        merge_mappings(existing, value)
                    }
                    _ => value,
                };
                base.insert(key, merged);
            }
            Value::Mapping(base)
        }
        (_, child) => child,
    }
}

fn union_sequences(base: Value, child: Value) -> Value {
    let mut out: Vec<Value> = match base {
        Value::Sequence(items) => items,
        other => vec![other],
    };
    let extra = match child {
        Value::Sequence(items) => items,
        other => vec![other],
    };
    for item in extra {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    Value::Sequence(out)
}

fn resolve_policy(mut value: Value, base_dir: &Path, chain: &mut Vec<PathBuf>) -> Result<Value, ConfigError> {
    let extends = match value.as_mapping_mut() {
        Some(map) => map.remove(EXTENDS_KEY),
        None => None,
    };
    let Some(extends) = extends else {
        return Ok(value);
    };
    let Some(rel) = extends.as_str() else {
        return Err(ConfigError::Invalid("policy.extends must be a path".to_string()));
    };

    let base_path = base_dir.join(rel);
    let base = resolve_policy_file(&base_path, chain)?;
    Ok(merge_policy(base, value))
}

fn resolve_policy_file(path: &Path, chain: &mut Vec<PathBuf>) -> Result<Value, ConfigError> {
    let key = canonical(path);
    if chain.contains(&key) {
        return Err(ConfigError::InheritanceCycle(path.to_path_buf()));
    }
    if chain.len() > MAX_EXTENDS_DEPTH {
        return Err(ConfigError::InheritanceTooDeep {
            path: path.to_path_buf(),
            max: MAX_EXTENDS_DEPTH,
        });
    }
    chain.push(key);

    let mut root = read_yaml(path)?;
    if let Some(section) = root.as_mapping_mut().and_then(|m| m.remove("policy")) {
        root = section;
    }
    if !root.is_mapping() {
        return Err(parse_error(path, "policy must be a mapping"));
    }
    resolve_policy(root, &parent_dir(path), chain)
}

fn policy_from_value(value: Value, path: &Path) -> Result<Policy, ConfigError> {
    let policy: Policy = from_value(value, path, "policy")?;
    policy.validate().map_err(ConfigError::Invalid)?;
    Ok(policy)
}

fn from_value<T: serde::de::DeserializeOwned>(value: Value, path: &Path, section: &str) -> Result<T, ConfigError> {
    serde_yaml::from_value(value).map_err(|e| parse_error(path, format!("invalid {} section: {}", section, e)))
}

fn read_yaml(path: &Path) -> Result<Value, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&content).map_err(|e| parse_error(path, e.to_string()))
}

fn parse_error(path: &Path, message: impl Into<String>) -> ConfigError {
    ConfigError::Parse {
        path: path.to_path_buf(),
        message: message.into(),
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    path.parent().map(Path::to_path_buf).unwrap_or_default()
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
