//! Attack Mode approval protocol and sessions
//!
//! Escalation to active testing walks REQUESTED -> RISK_ACKNOWLEDGED ->
//! TOKEN_VERIFIED -> APPROVED. Each transition is audited, steps cannot be
//! skipped, and the resulting session is locked to an explicit host list.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;

use super::authorization::{DNS_RECORD_VERSION, parse_expiry};
use super::signing::TokenKey;
use crate::audit::{AuditLog, events};
use crate::domain::{AttackModeConfig, new_session_id};

/// Default session lifetime
pub const DEFAULT_SESSION_HOURS: u32 = 2;

/// Text the operator must confirm before a token is checked
pub const RISK_ACKNOWLEDGEMENT: &str = "I understand active testing may disrupt the target";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AttackModeError {
    #[error("Attack Mode is disabled by policy")]
    Disabled,

    #[error("Attack Mode requires at least one host in scope")]
    EmptyScope,

    #[error("Wildcard host '{0}' is not permitted in an Attack Mode scope")]
    WildcardHost(String),

    #[error("Attack '{0}' is forbidden")]
    ForbiddenAttack(String),

    #[error("Attack '{0}' is not in the policy's allowed attacks")]
    AttackNotAllowed(String),

    #[error("Risk acknowledgement does not match")]
    RiskNotAcknowledged,

    #[error("Approval token rejected: {0}")]
    InvalidToken(String),

    #[error("Approval token expired")]
    TokenExpired,

    #[error("Cannot {action} while {state}")]
    OutOfOrder {
        action: &'static str,
        state: &'static str,
    },
}

impl AttackModeError {
    pub fn reason(&self) -> &'static str {
        match self {
            AttackModeError::Disabled => "attack_mode_disabled",
            AttackModeError::EmptyScope => "empty_scope",
            AttackModeError::WildcardHost(_) => "wildcard_host",
            AttackModeError::ForbiddenAttack(_) => "forbidden_attack",
            AttackModeError::AttackNotAllowed(_) => "attack_not_allowed",
            AttackModeError::RiskNotAcknowledged => "risk_not_acknowledged",
            AttackModeError::InvalidToken(_) => "invalid_token",
            AttackModeError::TokenExpired => "token_expired",
            AttackModeError::OutOfOrder { .. } => "out_of_order",
        }
    }
}

/// Approval protocol state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttackState {
    Requested,
    RiskAcknowledged,
    TokenVerified,
    Approved,
    Rejected,
}

impl AttackState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttackState::Requested => "REQUESTED",
            AttackState::RiskAcknowledged => "RISK_ACKNOWLEDGED",
            AttackState::TokenVerified => "TOKEN_VERIFIED",
            AttackState::Approved => "APPROVED",
            AttackState::Rejected => "REJECTED",
        }
    }
}

/// What the operator asks to be allowed to do
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttackRequest {
    pub hosts: Vec<String>,
    pub attacks: Vec<String>,
    /// Acknowledgement text, if already given
    pub acknowledgement: Option<String>,
    /// Approval token, if already available
    pub token: Option<String>,
}

impl AttackRequest {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hosts: hosts.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_attack(mut self, attack: impl Into<String>) -> Self {
        self.attacks.push(attack.into());
        self
    }

    pub fn acknowledged(mut self) -> Self {
        self.acknowledgement = Some(RISK_ACKNOWLEDGEMENT.to_string());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// Fields of a signed approval token
/// `v=testuniverse1;scope=host1,host2;expires=<ts>;approver=<who>;sig=<sig>`,
/// where `sig` is the HMAC of `scope|expires|approver`
#[derive(Debug, Clone, PartialEq, Eq)]
struct ApprovalToken {
    scope: Vec<String>,
    expires: Option<String>,
    approver: Option<String>,
}

fn parse_token(raw: &str, key: Option<&TokenKey>) -> Result<ApprovalToken, AttackModeError> {
    let mut version = None;
    let mut scope = Vec::new();
    let mut expires = None;
    let mut approver = None;
    let mut sig = None;
    for part in raw.trim().split(';') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "v" => version = Some(format!("v={}", value)),
            "scope" => {
                scope = value
                    .split(',')
                    .map(|h| h.trim().to_ascii_lowercase())
                    .filter(|h| !h.is_empty())
                    .collect()
            }
            "expires" => expires = Some(value.to_string()),
            "approver" => approver = Some(value.to_string()),
            "sig" => sig = Some(value.to_string()),
            _ => {}
        }
    }
    if version.as_deref() != Some(DNS_RECORD_VERSION) {
        return Err(AttackModeError::InvalidToken("unknown token version".into()));
    }
    let Some(sig) = sig.filter(|s| !s.is_empty()) else {
        return Err(AttackModeError::InvalidToken("token is not signed".into()));
    };
    if scope.is_empty() {
        return Err(AttackModeError::InvalidToken("token has no scope".into()));
    }
    let Some(key) = key else {
        return Err(AttackModeError::InvalidToken("no token verification key configured".into()));
    };
    let signed = [
        scope.join(","),
        expires.clone().unwrap_or_default(),
        approver.clone().unwrap_or_default(),
    ];
    let fields: Vec<&str> = signed.iter().map(String::as_str).collect();
    if !key.verify(&fields, &sig) {
        return Err(AttackModeError::InvalidToken("signature does not match".into()));
    }
    Ok(ApprovalToken {
        scope,
        expires,
        approver,
    })
}

/// An approved, time-boxed, scope-locked Attack Mode session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttackModeSession {
    pub session_id: String,
    pub approved_scope: Vec<String>,
    pub attacks: Vec<String>,
    pub approved_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Who signed the approval token
    pub approver: String,
}

/// Why a session no longer covers a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionBlock {
    Expired,
    OutOfScope,
}

impl AttackModeSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn covers(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.approved_scope.iter().any(|h| *h == host)
    }

    pub fn check(&self, host: &str, now: DateTime<Utc>) -> Result<(), SessionBlock> {
        if self.is_expired(now) {
            return Err(SessionBlock::Expired);
        }
        if !self.covers(host) {
            return Err(SessionBlock::OutOfScope);
        }
        Ok(())
    }
}

/// One pass through the approval protocol
#[derive(Debug)]
pub struct AttackApproval {
    state: AttackState,
    config: AttackModeConfig,
    hosts: Vec<String>,
    attacks: Vec<String>,
    approver: Option<String>,
    key: Option<TokenKey>,
}

impl AttackApproval {
    /// Open a request. Policy gates (enabled, forbidden and allowed attacks,
    /// wildcard hosts) are checked here, before any state is entered.
    pub fn request(
        config: &AttackModeConfig,
        hosts: &[String],
        attacks: &[String],
        audit: &AuditLog,
    ) -> Result<Self, AttackModeError> {
        let result = Self::check_request(config, hosts, attacks);
        if let Err(err) = &result {
            audit.warn(
                events::ATTACK_MODE_REJECTED,
                json!({"state": "REQUESTED", "reason": err.reason(), "detail": err.to_string()}),
            );
            return Err(err.clone());
        }

        let hosts: Vec<String> = hosts.iter().map(|h| h.trim().to_ascii_lowercase()).collect();
        let attacks: Vec<String> = attacks.iter().map(|a| a.trim().to_lowercase()).collect();
        audit.warn(
            events::ATTACK_MODE_REQUESTED,
            json!({"hosts": hosts, "attacks": attacks}),
        );
        Ok(Self {
            state: AttackState::Requested,
            config: config.clone(),
            hosts,
            attacks,
            approver: None,
            key: None,
        })
    }

    /// Key that approval tokens must be signed with. Without one every
    /// token is rejected.
    pub fn with_token_key(mut self, key: Option<TokenKey>) -> Self {
        self.key = key;
        self
    }

    fn check_request(
        config: &AttackModeConfig,
        hosts: &[String],
        attacks: &[String],
    ) -> Result<(), AttackModeError> {
        if !config.enabled {
            return Err(AttackModeError::Disabled);
        }
        if hosts.is_empty() {
            return Err(AttackModeError::EmptyScope);
        }
        if let Some(wild) = hosts.iter().find(|h| h.contains('*') || h.contains('?')) {
            return Err(AttackModeError::WildcardHost(wild.clone()));
        }
        for attack in attacks {
            if config.is_forbidden(attack) {
                return Err(AttackModeError::ForbiddenAttack(attack.clone()));
            }
            if !config.allowed_attacks.is_empty()
                && !config
                    .allowed_attacks
                    .iter()
                    .any(|a| a.eq_ignore_ascii_case(attack))
            {
                return Err(AttackModeError::AttackNotAllowed(attack.clone()));
            }
        }
        Ok(())
    }

    pub fn state(&self) -> AttackState {
        self.state
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    fn expect_state(&self, expected: AttackState, action: &'static str) -> Result<(), AttackModeError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(AttackModeError::OutOfOrder {
                action,
                state: self.state.as_str(),
            })
        }
    }

    fn reject(&mut self, err: AttackModeError, audit: &AuditLog) -> AttackModeError {
        audit.warn(
            events::ATTACK_MODE_REJECTED,
            json!({
                "state": self.state.as_str(),
                "reason": err.reason(),
                "detail": err.to_string(),
            }),
        );
        self.state = AttackState::Rejected;
        err
    }

    /// Step 1: the operator confirms the risk statement
    pub fn acknowledge_risk(&mut self, acknowledgement: &str, audit: &AuditLog) -> Result<(), AttackModeError> {
        self.expect_state(AttackState::Requested, "acknowledge risk")?;
        if acknowledgement.trim() != RISK_ACKNOWLEDGEMENT {
            return Err(self.reject(AttackModeError::RiskNotAcknowledged, audit));
        }
        self.state = AttackState::RiskAcknowledged;
        audit.warn(
            events::ATTACK_MODE_RISK_ACKNOWLEDGED,
            json!({"hosts": self.hosts}),
        );
        Ok(())
    }

    /// Step 2: the signed approval token must cover every requested host
    pub fn verify_token(&mut self, token: &str, now: DateTime<Utc>, audit: &AuditLog) -> Result<(), AttackModeError> {
        self.expect_state(AttackState::RiskAcknowledged, "verify token")?;
        let parsed = match parse_token(token, self.key.as_ref()) {
            Ok(parsed) => parsed,
            Err(err) => return Err(self.reject(err, audit)),
        };
        if let Some(raw) = &parsed.expires {
            match parse_expiry(raw) {
                Some(at) if at <= now => return Err(self.reject(AttackModeError::TokenExpired, audit)),
                Some(_) => {}
                None => {
                    let err = AttackModeError::InvalidToken(format!("unparseable expiry '{}'", raw));
                    return Err(self.reject(err, audit));
                }
            }
        }
        if let Some(uncovered) = self.hosts.iter().find(|h| !parsed.scope.contains(h)) {
            let err = AttackModeError::InvalidToken(format!("token does not cover {}", uncovered));
            return Err(self.reject(err, audit));
        }

        self.approver = parsed.approver;
        self.state = AttackState::TokenVerified;
        audit.warn(
            events::ATTACK_MODE_TOKEN_VERIFIED,
            json!({"hosts": self.hosts, "approver": self.approver}),
        );
        Ok(())
    }

    /// Step 3: issue the session
    pub fn approve(&mut self, now: DateTime<Utc>, audit: &AuditLog) -> Result<AttackModeSession, AttackModeError> {
        self.expect_state(AttackState::TokenVerified, "approve")?;

        let hours = DEFAULT_SESSION_HOURS.min(self.config.max_duration_hours.max(1));
        let session = AttackModeSession {
            session_id: new_session_id(),
            approved_scope: self.hosts.clone(),
            attacks: self.attacks.clone(),
            approved_at: now,
            expires_at: now + Duration::hours(i64::from(hours)),
            approver: self.approver.clone().unwrap_or_else(|| "unknown".to_string()),
        };
        self.state = AttackState::Approved;
        audit.critical(
            events::ATTACK_MODE_APPROVED,
            json!({
                "session_id": session.session_id,
                "hosts": session.approved_scope,
                "attacks": session.attacks,
                "expires_at": session.expires_at.to_rfc3339(),
                "approver": session.approver,
            }),
        );
        Ok(session)
    }

    /// Run every remaining step with what the request carries. Stops at the
    /// first step whose input is missing, leaving the approval pending.
    pub fn advance(
        &mut self,
        request: &AttackRequest,
        now: DateTime<Utc>,
        audit: &AuditLog,
    ) -> Result<Option<AttackModeSession>, AttackModeError> {
        if self.state == AttackState::Requested {
            match &request.acknowledgement {
                Some(ack) => self.acknowledge_risk(ack, audit)?,
                None => return Ok(None),
            }
        }
        if self.state == AttackState::RiskAcknowledged {
            match &request.token {
                Some(token) => self.verify_token(token, now, audit)?,
                None => return Ok(None),
            }
        }
        if self.state == AttackState::TokenVerified {
            return self.approve(now, audit).map(Some);
        }
        Err(AttackModeError::OutOfOrder {
            action: "advance",
            state: self.state.as_str(),
        })
    }
}
