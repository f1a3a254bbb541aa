//! Governance: authorization, scope, rate limiting and Attack Mode
//!
//! Everything that can veto traffic to a target lives here. The
//! [`Governor`] composes the other pieces and is the only component allowed
//! to hand out the capability a sandbox needs to run.

mod attack_mode;
mod authorization;
mod governor;
mod rate_limit;
mod scope;
mod signing;

pub use attack_mode::{
    AttackApproval, AttackModeError, AttackModeSession, AttackRequest, AttackState,
    DEFAULT_SESSION_HOURS, RISK_ACKNOWLEDGEMENT, SessionBlock,
};
pub use authorization::{
    AUTH_PROOF_ENV, NetworkProofSource, ProofCheck, ProofSource, WELL_KNOWN_PATH,
    WellKnownDocument, parse_expiry, verify_proof,
};
pub use governor::{Admission, Decision, Governor, RunCapability, RunMode, Veto};
pub use rate_limit::{RateAdjustment, RateLimitError, RateLimiter, RatePermit, RateSnapshot};
pub use scope::{ScopeBlock, ScopeEnforcer, ScopeError};
pub use signing::{TokenKey, sign_approval_token, sign_env_token};

#[cfg(test)]
pub(crate) use governor::test_support;
