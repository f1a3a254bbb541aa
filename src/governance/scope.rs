//! URL scope enforcement
//!
//! Consulted for every outbound URL, not only at run start: crawling plugins
//! discover new URLs mid-run. Exclude patterns always win over includes.

use serde::Serialize;
use serde_json::json;
use url::Url;

use crate::audit::{AuditLog, events};
use crate::domain::{ScopeRules, Target};

#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    #[error("Invalid scope pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
}

/// Why a URL was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeBlock {
    InvalidUrl,
    ProtocolNotAllowed,
    Excluded,
    OtherOrigin,
    DomainNotAllowed,
    NotIncluded,
    TooDeep,
}

impl ScopeBlock {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeBlock::InvalidUrl => "invalid_url",
            ScopeBlock::ProtocolNotAllowed => "protocol_not_allowed",
            ScopeBlock::Excluded => "excluded",
            ScopeBlock::OtherOrigin => "other_origin",
            ScopeBlock::DomainNotAllowed => "domain_not_allowed",
            ScopeBlock::NotIncluded => "out_of_scope",
            ScopeBlock::TooDeep => "max_depth_exceeded",
        }
    }
}

/// A compiled glob. Patterns without a scheme or path match the host only.
#[derive(Debug, Clone)]
struct ScopePattern {
    raw: String,
    pattern: glob::Pattern,
    host_only: bool,
}

impl ScopePattern {
    fn compile(raw: &str) -> Result<Self, ScopeError> {
        let trimmed = raw.trim();
        let host_only = !trimmed.contains("://") && !trimmed.contains('/');
        let source = if host_only {
            trimmed.to_ascii_lowercase()
        } else {
            trimmed.to_string()
        };
        let pattern = glob::Pattern::new(&source).map_err(|e| ScopeError::InvalidPattern {
            pattern: raw.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            raw: raw.to_string(),
            pattern,
            host_only,
        })
    }

    fn matches(&self, url: &Url, host: &str) -> bool {
        if self.host_only {
            return self.pattern.matches(host);
        }
        let full = url.as_str();
        if self.pattern.matches(full) {
            return true;
        }
        // `https://host/*` should also cover the bare origin `https://host`
        full.ends_with('/') && self.pattern.matches(full.trim_end_matches('/'))
    }
}

/// Matches URLs against a target's scope rules
#[derive(Debug, Clone)]
pub struct ScopeEnforcer {
    rules: ScopeRules,
    target_host: Option<String>,
    include: Vec<ScopePattern>,
    exclude: Vec<ScopePattern>,
}

impl ScopeEnforcer {
    pub fn new(target: &Target) -> Result<Self, ScopeError> {
        Self::from_rules(target.scope.clone(), target.host())
    }

    pub fn from_rules(rules: ScopeRules, target_host: Option<String>) -> Result<Self, ScopeError> {
        let include = rules
            .include
            .iter()
            .map(|p| ScopePattern::compile(p))
            .collect::<Result<Vec<_>, _>>()?;
        let exclude = rules
            .exclude
            .iter()
            .map(|p| ScopePattern::compile(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            rules,
            target_host,
            include,
            exclude,
        })
    }

    pub fn rules(&self) -> &ScopeRules {
        &self.rules
    }

    /// Decide a URL without side effects
    pub fn check(&self, raw: &str) -> Result<(), ScopeBlock> {
        let url = Url::parse(raw.trim()).map_err(|_| ScopeBlock::InvalidUrl)?;
        let host = url
            .host_str()
            .map(|h| h.to_ascii_lowercase())
            .ok_or(ScopeBlock::InvalidUrl)?;

        let scheme = url.scheme();
        let protocol_ok = if self.rules.protocols.is_empty() {
            scheme == "http" || scheme == "https"
        } else {
            self.rules
                .protocols
                .iter()
                .any(|p| p.trim_end_matches("://").eq_ignore_ascii_case(scheme))
        };
        if !protocol_ok {
            return Err(ScopeBlock::ProtocolNotAllowed);
        }

        if self.exclude.iter().any(|p| p.matches(&url, &host)) {
            return Err(ScopeBlock::Excluded);
        }

        if self.rules.same_origin {
            if let Some(target_host) = &self.target_host {
                if &host != target_host {
                    return Err(ScopeBlock::OtherOrigin);
                }
            }
        }

        if !self.rules.allowed_domains.is_empty()
            && !self
                .rules
                .allowed_domains
                .iter()
                .any(|d| domain_matches(&host, d))
        {
            return Err(ScopeBlock::DomainNotAllowed);
        }

        if !self.include.is_empty() && !self.include.iter().any(|p| p.matches(&url, &host)) {
            return Err(ScopeBlock::NotIncluded);
        }

        if let Some(max_depth) = self.rules.max_depth {
            let depth = url
                .path_segments()
                .map(|segs| segs.filter(|s| !s.is_empty()).count())
                .unwrap_or(0);
            if depth > max_depth as usize {
                return Err(ScopeBlock::TooDeep);
            }
        }

        Ok(())
    }

    pub fn allowed(&self, url: &str) -> bool {
        self.check(url).is_ok()
    }

    /// Decide a URL and audit the outcome. Denials are non-fatal `scope_blocked`
    /// events; the caller drops that single request.
    pub fn enforce(&self, url: &str, audit: &AuditLog) -> bool {
        match self.check(url) {
            Ok(()) => {
                audit.debug(events::SCOPE_CHECK, json!({"url": url, "result": "allowed"}));
                true
            }
            Err(block) => {
                audit.warn(
                    events::SCOPE_BLOCKED,
                    json!({"url": url, "reason": block.as_str()}),
                );
                false
            }
        }
    }

    /// Keep the URLs that are in scope, auditing each denial
    pub fn filter_urls<I, S>(&self, urls: I, audit: &AuditLog) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut kept: Vec<String> = Vec::new();
        for url in urls {
            let url = url.as_ref().trim();
            if url.is_empty() || kept.iter().any(|k| k == url) {
                continue;
            }
            if self.enforce(url, audit) {
                kept.push(url.to_string());
            }
        }
        kept
    }

    /// Patterns as written, for reports
    pub fn describe(&self) -> (Vec<&str>, Vec<&str>) {
        (
            self.include.iter().map(|p| p.raw.as_str()).collect(),
            self.exclude.iter().map(|p| p.raw.as_str()).collect(),
        )
    }
}

fn domain_matches(host: &str, domain: &str) -> bool {
    let domain = domain.trim().trim_start_matches("*.").to_ascii_lowercase();
    host == domain || host.ends_with(&format!(".{}", domain))
}
