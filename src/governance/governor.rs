//! The Governor: single choke point with veto power over every job
//!
//! `authorize` is the only way to obtain a [`RunCapability`], and `admit`
//! (which needs one) is the only way to obtain the [`Admission`] a sandbox
//! requires. A DENY therefore leaves the run without any path to execution.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::json;

use super::attack_mode::{AttackApproval, AttackModeError, AttackModeSession, AttackRequest, SessionBlock};
use super::authorization::{ProofCheck, ProofSource, verify_proof};
use super::rate_limit::{RateLimiter, RatePermit};
use super::scope::{ScopeEnforcer, ScopeError};
use super::signing::TokenKey;
use crate::audit::{AuditLog, events};
use crate::domain::{ExecutionSpec, Policy, RateLimitConfig, Target, TrafficClass};
use crate::sandbox::CancelToken;

/// Requested run mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    Passive,
    Attack(AttackRequest),
}

/// Proof that the Governor allowed this run. Only the Governor constructs it.
#[derive(Debug)]
pub struct RunCapability {
    run_id: String,
    target_id: String,
    host: Option<String>,
    proof_method: Option<&'static str>,
    authorized_at: DateTime<Utc>,
    session: Mutex<Option<AttackModeSession>>,
}

impl RunCapability {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn proof_method(&self) -> Option<&'static str> {
        self.proof_method
    }

    pub fn authorized_at(&self) -> DateTime<Utc> {
        self.authorized_at
    }

    /// The current Attack Mode session, if the run is still escalated
    pub fn session(&self) -> Option<AttackModeSession> {
        self.session.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_attack_mode(&self) -> bool {
        self.session().is_some()
    }

    fn set_session(&self, session: Option<AttackModeSession>) {
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = session;
    }
}

/// Outcome of `Governor::authorize`
#[derive(Debug)]
pub enum Decision {
    Allow(RunCapability),
    /// Terminal for the run
    Deny { reason: String },
    /// Passive testing is allowed; the Attack Mode approval still needs input
    AttackPending {
        capability: RunCapability,
        approval: AttackApproval,
    },
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow(_) => "ALLOW",
            Decision::Deny { .. } => "DENY",
            Decision::AttackPending { .. } => "ATTACK_PENDING",
        }
    }

    pub fn is_deny(&self) -> bool {
        matches!(self, Decision::Deny { .. })
    }
}

/// Why a job was not admitted
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Veto {
    #[error("run was denied by the governor")]
    RunDenied,

    #[error("capability belongs to another run")]
    ForeignCapability,

    #[error("active traffic requires an approved Attack Mode session ({0})")]
    AttackModeRequired(&'static str),

    #[error("host {0} is out of scope")]
    OutOfScope(String),

    #[error("rate limiter unavailable")]
    RateLimiterClosed,

    #[error("job was cancelled while waiting for admission")]
    Cancelled,
}

impl Veto {
    pub fn reason(&self) -> &'static str {
        match self {
            Veto::RunDenied => "run_denied",
            Veto::ForeignCapability => "foreign_capability",
            Veto::AttackModeRequired(reason) => reason,
            Veto::OutOfScope(_) => "scope_blocked",
            Veto::RateLimiterClosed => "rate_limiter_closed",
            Veto::Cancelled => "cancelled",
        }
    }
}

/// Permission for one job to run. Holds the job's rate-limit slot, if its
/// traffic reaches the target; dropping it releases the slot.
#[derive(Debug)]
pub struct Admission {
    plugin_id: String,
    traffic: TrafficClass,
    permit: Option<RatePermit>,
}

impl Admission {
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn traffic(&self) -> TrafficClass {
        self.traffic
    }

    pub fn host(&self) -> Option<&str> {
        self.permit.as_ref().map(RatePermit::host)
    }
}

/// Composes authorization, scope, rate limiting and Attack Mode for one run
pub struct Governor {
    target: Target,
    policy: Policy,
    audit: Arc<AuditLog>,
    proofs: Arc<dyn ProofSource>,
    scope: ScopeEnforcer,
    limiter: RateLimiter,
    token_key: Option<TokenKey>,
    denied: AtomicBool,
    authorized: AtomicBool,
}

impl Governor {
    pub fn new(
        target: Target,
        policy: Policy,
        audit: Arc<AuditLog>,
        proofs: Arc<dyn ProofSource>,
        limiter: RateLimiter,
    ) -> Result<Self, ScopeError> {
        let scope = ScopeEnforcer::new(&target)?;
        Ok(Self {
            target,
            policy,
            audit,
            proofs,
            scope,
            limiter,
            token_key: None,
            denied: AtomicBool::new(false),
            authorized: AtomicBool::new(false),
        })
    }

    /// Key that signed environment and Attack Mode tokens are checked against
    pub fn with_token_key(mut self, key: Option<TokenKey>) -> Self {
        self.token_key = key;
        self
    }

    pub fn scope(&self) -> &ScopeEnforcer {
        &self.scope
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn is_denied(&self) -> bool {
        self.denied.load(Ordering::SeqCst)
    }

    fn deny(&self, reason: String, method: Option<&'static str>) -> Decision {
        self.denied.store(true, Ordering::SeqCst);
        self.audit.critical(
            events::AUTH_DENIED,
            json!({
                "target": self.target.id,
                "reason": reason,
                "method": method,
            }),
        );
        tracing::error!("Authorization denied for {}: {}", self.target.id, reason);
        Decision::Deny { reason }
    }

    /// Decide whether the run may proceed. Any DENY is terminal: later calls
    /// keep denying and `admit` vetoes every job.
    pub async fn authorize(&self, run_id: &str, mode: &RunMode, rate: RateLimitConfig) -> Decision {
        let host = self.target.host();
        self.audit.info(
            events::AUTH_CHECK,
            json!({
                "target": self.target.id,
                "host": host,
                "mode": match mode { RunMode::Passive => "passive", RunMode::Attack(_) => "attack" },
            }),
        );

        if self.is_denied() {
            return self.deny("run_previously_denied".to_string(), None);
        }
        if let Err(e) = self.target.validate() {
            return self.deny(format!("invalid_target: {}", e), None);
        }
        if self.target.target_type.is_networked() && !self.scope.enforce(&self.target.url, &self.audit) {
            let reason = self
                .scope
                .check(&self.target.url)
                .err()
                .map(|b| b.as_str())
                .unwrap_or("out_of_scope");
            return self.deny(format!("target_out_of_scope: {}", reason), None);
        }

        let check = verify_proof(&self.target, self.proofs.as_ref(), self.token_key.as_ref(), Utc::now()).await;
        let method = check.method();
        if !matches!(check, ProofCheck::Valid { .. }) {
            return self.deny(check.reason(), method);
        }

        if let Some(host) = &host {
            if self.limiter.configure(host, rate).is_err() {
                return self.deny("rate_limiter_unavailable".to_string(), method);
            }
        }

        self.authorized.store(true, Ordering::SeqCst);
        let capability = RunCapability {
            run_id: run_id.to_string(),
            target_id: self.target.id.clone(),
            host,
            proof_method: method,
            authorized_at: Utc::now(),
            session: Mutex::new(None),
        };
        self.audit.info(
            events::AUTH_CHECK,
            json!({"target": self.target.id, "result": "allowed", "method": method}),
        );

        match mode {
            RunMode::Passive => Decision::Allow(capability),
            RunMode::Attack(request) => self.escalate(capability, request),
        }
    }

    fn escalate(&self, capability: RunCapability, request: &AttackRequest) -> Decision {
        let mut approval = match AttackApproval::request(
            &self.policy.attack_mode,
            &request.hosts,
            &request.attacks,
            &self.audit,
        ) {
            Ok(approval) => approval.with_token_key(self.token_key.clone()),
            Err(err) => {
                self.downgrade(&err);
                return Decision::Allow(capability);
            }
        };
        match approval.advance(request, Utc::now(), &self.audit) {
            Ok(Some(session)) => {
                capability.set_session(Some(session));
                Decision::Allow(capability)
            }
            Ok(None) => Decision::AttackPending {
                capability,
                approval,
            },
            Err(err) => {
                self.downgrade(&err);
                Decision::Allow(capability)
            }
        }
    }

    fn downgrade(&self, err: &AttackModeError) {
        self.audit.warn(
            events::ATTACK_MODE_UNAVAILABLE,
            json!({"reason": err.reason(), "detail": err.to_string(), "mode": "passive"}),
        );
        tracing::warn!("Attack Mode unavailable, continuing passively: {}", err);
    }

    /// Feed more input into a pending approval. Returns whether the run is
    /// now in Attack Mode.
    pub fn continue_attack(
        &self,
        capability: &RunCapability,
        approval: &mut AttackApproval,
        request: &AttackRequest,
    ) -> Result<bool, AttackModeError> {
        match approval.advance(request, Utc::now(), &self.audit) {
            Ok(Some(session)) => {
                capability.set_session(Some(session));
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(err) => {
                self.downgrade(&err);
                Err(err)
            }
        }
    }

    /// Check that active traffic to `host` is still covered by the session.
    /// Expiry or a scope mismatch drops the run back to passive mode.
    pub fn check_session(&self, capability: &RunCapability, host: &str, now: DateTime<Utc>) -> Result<(), Veto> {
        let Some(session) = capability.session() else {
            return Err(Veto::AttackModeRequired("attack_mode_unavailable"));
        };
        match session.check(host, now) {
            Ok(()) => Ok(()),
            Err(SessionBlock::Expired) => {
                capability.set_session(None);
                self.audit.warn(
                    events::SESSION_EXPIRED,
                    json!({"session_id": session.session_id, "expired_at": session.expires_at.to_rfc3339()}),
                );
                Err(Veto::AttackModeRequired("session_expired"))
            }
            Err(SessionBlock::OutOfScope) => {
                capability.set_session(None);
                self.audit.warn(
                    events::SCOPE_BLOCKED,
                    json!({
                        "session_id": session.session_id,
                        "host": host,
                        "reason": "outside_attack_scope",
                    }),
                );
                Err(Veto::AttackModeRequired("scope_blocked"))
            }
        }
    }

    /// Mandatory gate before a sandbox starts: re-checks the run's standing,
    /// the job's traffic class, then waits for rate-limiter admission. The
    /// wait ends early with [`Veto::Cancelled`] once `cancel` fires.
    pub async fn admit(
        &self,
        capability: &RunCapability,
        spec: &ExecutionSpec,
        cancel: &CancelToken,
    ) -> Result<Admission, Veto> {
        if self.is_denied() || !self.authorized.load(Ordering::SeqCst) {
            return Err(Veto::RunDenied);
        }
        if capability.target_id != self.target.id {
            return Err(Veto::ForeignCapability);
        }
        if cancel.is_cancelled() {
            return Err(Veto::Cancelled);
        }

        let host = spec
            .target_host
            .clone()
            .or_else(|| capability.host.clone());

        if spec.traffic == TrafficClass::Active {
            let host = host.as_deref().unwrap_or_default();
            self.check_session(capability, host, Utc::now())?;
        }

        let permit = match (&host, spec.traffic.touches_target()) {
            (Some(host), true) => {
                if capability.host.as_deref() != Some(host.as_str())
                    && !self.scope.enforce(&self.url_for_host(host), &self.audit)
                {
                    return Err(Veto::OutOfScope(host.clone()));
                }
                let permit = tokio::select! {
                    permit = self.limiter.acquire(host, None) => permit.map_err(|_| Veto::RateLimiterClosed)?,
                    _ = cancel.cancelled() => {
                        tracing::debug!("{} cancelled while waiting for {}", spec.plugin_id, host);
                        return Err(Veto::Cancelled);
                    }
                };
                Some(permit)
            }
            _ => None,
        };

        Ok(Admission {
            plugin_id: spec.plugin_id.clone(),
            traffic: spec.traffic,
            permit,
        })
    }

    /// Root URL for another host, reached the same way as the target
    fn url_for_host(&self, host: &str) -> String {
        let scheme = url::Url::parse(&self.target.url)
            .map(|u| u.scheme().to_string())
            .unwrap_or_else(|_| "https".to_string());
        format!("{}://{}/", scheme, host)
    }

    /// Per-request scope check for URLs discovered mid-run
    pub fn allow_url(&self, url: &str) -> bool {
        self.scope.enforce(url, &self.audit)
    }

    /// Feed an observed HTTP status into the adaptive rate loop
    pub async fn observe_status(&self, host: &str, status: u16) {
        match self.limiter.observe(host, status).await {
            Ok(Some(adjustment)) => match serde_json::to_value(&adjustment) {
                Ok(payload) => {
                    self.audit.warn(events::RATE_ADJUSTED, payload);
                }
                Err(e) => tracing::warn!("Failed to record rate adjustment for {}: {}", host, e),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!("Failed to report status {} for {}: {}", status, host, e),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AttackModeConfig, AuthorizationProof, TargetType};
    use crate::governance::authorization::WellKnownDocument;
    use async_trait::async_trait;

    struct EnvOnly(Option<String>);

    #[async_trait]
    impl ProofSource for EnvOnly {
        async fn dns_txt(&self, _name: &str) -> anyhow::Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn well_known(&self, _base_url: &str) -> anyhow::Result<Option<WellKnownDocument>> {
            Ok(None)
        }

        fn env_var(&self, _name: &str) -> Option<String> {
            self.0.clone()
        }
    }

    fn target() -> Target {
        Target::new("app", TargetType::Web, "https://staging.example.com").with_authorization(
            AuthorizationProof::OwnerProof {
                proof: "signed".into(),
                expires: Some("2099-12-31".into()),
            },
        )
    }

    fn key() -> TokenKey {
        TokenKey::new("approval-secret").unwrap()
    }

    fn approval_token() -> String {
        crate::governance::sign_approval_token(&key(), &["staging.example.com"], Some("2099-01-01"), Some("secops"))
    }

    fn governor(target: Target, policy: Policy) -> (Governor, Arc<AuditLog>) {
        let audit = Arc::new(AuditLog::in_memory("run_abc"));
        let gov = Governor::new(
            target,
            policy,
            audit.clone(),
            Arc::new(EnvOnly(None)),
            RateLimiter::spawn(RateLimitConfig::default()),
        )
        .unwrap()
        .with_token_key(Some(key()));
        (gov, audit)
    }

    #[tokio::test]
    async fn missing_proof_denies_and_vetoes_every_job() {
        let target = Target::new("app", TargetType::Web, "https://staging.example.com");
        let (gov, audit) = governor(target, Policy::default());
        let decision = gov.authorize("run_abc", &RunMode::Passive, RateLimitConfig::default()).await;
        match &decision {
            Decision::Deny { reason } => assert_eq!(reason, "authorization_missing"),
            other => panic!("expected deny, got {}", other.as_str()),
        }
        assert_eq!(audit.count(events::AUTH_DENIED), 1);

        // A capability minted for a different governor still cannot run here
        let (other, _) = governor(self::target(), Policy::default());
        let Decision::Allow(cap) = other.authorize("run_abc", &RunMode::Passive, RateLimitConfig::default()).await else {
            panic!("expected allow");
        };
        let spec = ExecutionSpec::new("recon", vec!["true".into()]);
        assert_eq!(gov.admit(&cap, &spec, &CancelToken::new()).await.unwrap_err(), Veto::RunDenied);
    }

    #[tokio::test]
    async fn allow_admits_passive_jobs_with_rate_permit() {
        let (gov, _audit) = governor(target(), Policy::default());
        let Decision::Allow(cap) = gov.authorize("run_abc", &RunMode::Passive, RateLimitConfig::default()).await else {
            panic!("expected allow");
        };
        assert_eq!(cap.proof_method(), Some("owner_proof"));
        let spec = ExecutionSpec::new("recon", vec!["true".into()]);
        let admission = gov.admit(&cap, &spec, &CancelToken::new()).await.unwrap();
        assert_eq!(admission.host(), Some("staging.example.com"));

        let active = spec.clone().with_traffic(TrafficClass::Active);
        assert_eq!(
            gov.admit(&cap, &active, &CancelToken::new()).await.unwrap_err(),
            Veto::AttackModeRequired("attack_mode_unavailable")
        );
    }

    #[tokio::test]
    async fn target_outside_its_own_scope_is_denied() {
        let mut target = target();
        target.scope.exclude = vec!["staging.example.com".into()];
        let (gov, audit) = governor(target, Policy::default());
        let decision = gov.authorize("run_abc", &RunMode::Passive, RateLimitConfig::default()).await;
        assert!(decision.is_deny());
        assert_eq!(audit.count(events::SCOPE_BLOCKED), 1);
    }

    #[tokio::test]
    async fn attack_mode_pending_then_approved() {
        let policy = Policy {
            attack_mode: AttackModeConfig {
                enabled: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let (gov, audit) = governor(target(), policy);
        let request = AttackRequest::new(["staging.example.com"]);
        let decision = gov
            .authorize("run_abc", &RunMode::Attack(request.clone()), RateLimitConfig::default())
            .await;
        let Decision::AttackPending { capability, mut approval } = decision else {
            panic!("expected pending");
        };
        assert!(!capability.is_attack_mode());

        let request = request
            .acknowledged()
            .with_token(approval_token());
        assert!(gov.continue_attack(&capability, &mut approval, &request).unwrap());
        assert!(capability.is_attack_mode());

        let spec = ExecutionSpec::new("zap-active", vec!["zap".into()]).with_traffic(TrafficClass::Active);
        assert!(gov.admit(&capability, &spec, &CancelToken::new()).await.is_ok());

        let mut elsewhere = spec.clone();
        elsewhere.target_host = Some("prod.example.com".into());
        assert_eq!(
            gov.admit(&capability, &elsewhere, &CancelToken::new()).await.unwrap_err(),
            Veto::AttackModeRequired("scope_blocked")
        );
        // Scope mismatch downgrades the whole run
        assert!(!capability.is_attack_mode());
        assert_eq!(audit.count(events::ATTACK_MODE_APPROVED), 1);
    }

    #[tokio::test]
    async fn disabled_attack_mode_downgrades_to_passive() {
        let (gov, audit) = governor(target(), Policy::default());
        let request = AttackRequest::new(["staging.example.com"])
            .acknowledged()
            .with_token(approval_token());
        let decision = gov
            .authorize("run_abc", &RunMode::Attack(request), RateLimitConfig::default())
            .await;
        let Decision::Allow(cap) = decision else {
            panic!("expected allow");
        };
        assert!(!cap.is_attack_mode());
        assert_eq!(audit.count(events::ATTACK_MODE_UNAVAILABLE), 1);
    }

    #[tokio::test]
    async fn expired_session_is_dropped() {
        let (gov, audit) = governor(target(), Policy::default());
        let Decision::Allow(cap) = gov.authorize("run_abc", &RunMode::Passive, RateLimitConfig::default()).await else {
            panic!("expected allow");
        };
        let now = Utc::now();
        cap.set_session(Some(AttackModeSession {
            session_id: "atk_abc".into(),
            approved_scope: vec!["staging.example.com".into()],
            attacks: vec![],
            approved_at: now - chrono::Duration::hours(3),
            expires_at: now - chrono::Duration::hours(1),
            approver: "secops".into(),
        }));
        assert_eq!(
            gov.check_session(&cap, "staging.example.com", now).unwrap_err(),
            Veto::AttackModeRequired("session_expired")
        );
        assert!(!cap.is_attack_mode());
        assert_eq!(audit.count(events::SESSION_EXPIRED), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_ends_a_rate_limit_pause() {
        let (gov, audit) = governor(target(), Policy::default());
        let Decision::Allow(cap) = gov.authorize("run_abc", &RunMode::Passive, RateLimitConfig::default()).await else {
            panic!("expected allow");
        };
        gov.observe_status("staging.example.com", 503).await;
        assert_eq!(audit.count(events::RATE_ADJUSTED), 1);

        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let spec = ExecutionSpec::new("recon", vec!["true".into()]);
        assert_eq!(gov.admit(&cap, &spec, &cancel).await.unwrap_err(), Veto::Cancelled);
        let waited = started.elapsed();
        assert!(waited >= std::time::Duration::from_secs(5));
        assert!(waited < std::time::Duration::from_secs(60));

        // Already cancelled: no wait at all
        assert_eq!(gov.admit(&cap, &spec, &cancel).await.unwrap_err(), Veto::Cancelled);
    }

    #[tokio::test]
    async fn other_hosts_are_checked_with_the_target_scheme() {
        let mut target = Target::new("app", TargetType::Web, "http://staging.example.com").with_authorization(
            AuthorizationProof::OwnerProof {
                proof: "signed".into(),
                expires: None,
            },
        );
        target.scope.protocols = vec!["http".into()];
        target.scope.include = vec!["*.example.com".into()];
        let (gov, audit) = governor(target, Policy::default());
        let Decision::Allow(cap) = gov.authorize("run_abc", &RunMode::Passive, RateLimitConfig::default()).await else {
            panic!("expected allow");
        };

        let mut spec = ExecutionSpec::new("recon", vec!["true".into()]);
        spec.target_host = Some("api.example.com".into());
        let admission = gov.admit(&cap, &spec, &CancelToken::new()).await.unwrap();
        assert_eq!(admission.host(), Some("api.example.com"));
        assert_eq!(audit.count(events::SCOPE_BLOCKED), 0);
    }
}
