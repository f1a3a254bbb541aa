//! Identifier generation and validation for runs, findings and attack sessions

use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

static RUN_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^run_[a-z0-9]+$").expect("valid regex"));
static FINDING_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^find_[a-z0-9]+$").expect("valid regex"));
static SESSION_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^atk_[a-z0-9]+$").expect("valid regex"));

fn suffix() -> String {
    // simple() renders lowercase hex without hyphens
    Uuid::new_v4().simple().to_string()
}

/// Generate a new run ID (`run_<hex>`)
pub fn new_run_id() -> String {
    format!("run_{}", suffix())
}

/// Generate a new finding ID (`find_<hex>`)
pub fn new_finding_id() -> String {
    format!("find_{}", suffix())
}

/// Generate a new attack mode session ID (`atk_<hex>`)
pub fn new_session_id() -> String {
    format!("atk_{}", &suffix()[..12])
}

pub fn is_valid_run_id(id: &str) -> bool {
    RUN_ID_RE.is_match(id)
}

pub fn is_valid_finding_id(id: &str) -> bool {
    FINDING_ID_RE.is_match(id)
}

pub fn is_valid_session_id(id: &str) -> bool {
    SESSION_ID_RE.is_match(id)
}
