//! Core domain types for the TestUniverse kernel

mod execution;
mod finding;
mod gate;
mod ids;
mod plan;
mod policy;
mod severity;
mod target;

pub use execution::{
    Artifact, ExecutionResult, ExecutionSpec, ExecutionStatus, ResourceLimits, STDERR_ARTIFACT,
    STDOUT_ARTIFACT, TrafficClass,
};
pub use finding::{
    Evidence, FINDING_SCHEMA_VERSION, Finding, Fix, Location, SourceRef, TAG_INTERMITTENT,
    ToolInfo,
};
pub use gate::{ExitCode, GateResult, GateThresholds, SeverityCounts};
pub use ids::{
    is_valid_finding_id, is_valid_run_id, is_valid_session_id, new_finding_id, new_run_id,
    new_session_id,
};
pub use plan::{Plan, PlanEntry, ScanMode};
pub use policy::{
    ALWAYS_FORBIDDEN_ATTACKS, AttackModeConfig, ConfidenceWeights, MAX_TIMEBOX_SECONDS,
    MIN_TIMEBOX_SECONDS, Policy, RateLimitConfig, TriageConfig,
};
pub use severity::{Family, Severity};
pub use target::{AuthDescriptor, AuthorizationProof, ScopeRules, Target, TargetType};
