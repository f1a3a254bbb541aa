//! TestUniverse kernel
//!
//! Orchestrates external testing tools (security scanners, performance and
//! accessibility auditors) against one authorized target and turns their
//! output into a single deduplicated, confidence-scored set of findings with
//! a deterministic pass/fail quality gate.
//!
//! ## Run phases
//!
//! 1. **Authorize**: the [`governance::Governor`] checks the ownership proof
//!    and scope, and is the only source of the capability every job needs.
//! 2. **Schedule**: the plan's plugins run as a DAG on a bounded worker pool
//!    inside a sandbox, under a global timebox and per-host rate limits.
//! 3. **Normalize and triage**: output is validated, redacted, deduplicated
//!    and scored, then counted against the policy's gate.
//! 4. **Report**: `report.json` plus an append-only audit log per run.

pub mod audit;
pub mod config;
pub mod dag;
pub mod domain;
pub mod error;
pub mod governance;
pub mod kernel;
pub mod normalize;
pub mod plugin;
pub mod report;
pub mod sandbox;
pub mod triage;

pub use domain::*;
pub use error::KernelError;
pub use kernel::{Kernel, RunOptions, RunOutcome};
