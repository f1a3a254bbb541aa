//! Reproduction vectors from verification reruns

use std::collections::{BTreeMap, BTreeSet};

use super::fingerprint::fingerprint;
use crate::domain::Finding;

/// Whether each rerun reproduced a finding
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reproduction {
    pub runs: Vec<bool>,
}

impl Reproduction {
    pub fn reproduced(&self) -> usize {
        self.runs.iter().filter(|r| **r).count()
    }

    /// Every rerun agreed with the original run
    pub fn is_deterministic(&self) -> bool {
        !self.runs.is_empty() && self.runs.iter().all(|r| *r)
    }

    /// Reruns disagreed with each other or with the original run
    pub fn is_intermittent(&self) -> bool {
        !self.runs.is_empty() && !self.is_deterministic()
    }
}

/// Reproduction vectors keyed by fingerprint
#[derive(Debug, Clone, Default)]
pub struct Verification {
    vectors: BTreeMap<String, Reproduction>,
}

impl Verification {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one rerun of a plugin against the findings it produced first time
    pub fn record_rerun(&mut self, original: &[Finding], rerun: &[Finding]) {
        let seen: BTreeSet<String> = rerun.iter().map(fingerprint).collect();
        for finding in original {
            let fp = fingerprint(finding);
            let hit = seen.contains(&fp);
            self.vectors.entry(fp).or_default().runs.push(hit);
        }
    }

    pub fn get(&self, fingerprint: &str) -> Option<&Reproduction> {
        self.vectors.get(fingerprint)
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }
}
