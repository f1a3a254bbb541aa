//! Authorization proofs: evidence that the operator may test a target

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;

use super::signing::TokenKey;
use crate::domain::{AuthorizationProof, Target};

/// TXT record prefix: `_testuniverse.<host>`
pub const DNS_RECORD_PREFIX: &str = "_testuniverse";
pub const DNS_RECORD_VERSION: &str = "v=testuniverse1";
pub const WELL_KNOWN_PATH: &str = "/.well-known/testuniverse.json";
pub const AUTH_PROOF_ENV: &str = "TESTUNIVERSE_AUTH_PROOF";

/// Contents of `/.well-known/testuniverse.json`
#[derive(Debug, Clone, Deserialize)]
pub struct WellKnownDocument {
    pub authorization: String,
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub expires: Option<String>,
}

/// Where proof material comes from. The network implementation is used in
/// production; tests supply their own.
#[async_trait]
pub trait ProofSource: Send + Sync {
    /// TXT records for a DNS name
    async fn dns_txt(&self, name: &str) -> Result<Vec<String>>;

    /// The target's well-known authorization document, `None` if absent
    async fn well_known(&self, base_url: &str) -> Result<Option<WellKnownDocument>>;

    /// An environment variable
    fn env_var(&self, name: &str) -> Option<String>;
}

/// DNS-over-HTTPS and HTTPS lookups through `ureq`
pub struct NetworkProofSource {
    agent: ureq::Agent,
    doh_endpoint: String,
}

impl NetworkProofSource {
    pub fn new() -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(Duration::from_secs(10))
            .redirects(0)
            .build();
        Self {
            agent,
            doh_endpoint: "https://cloudflare-dns.com/dns-query".to_string(),
        }
    }

    pub fn with_doh_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.doh_endpoint = endpoint.into();
        self
    }
}

impl Default for NetworkProofSource {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct DohResponse {
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Deserialize)]
struct DohAnswer {
    data: String,
}

#[async_trait]
impl ProofSource for NetworkProofSource {
    async fn dns_txt(&self, name: &str) -> Result<Vec<String>> {
        let agent = self.agent.clone();
        let url = format!("{}?name={}&type=TXT", self.doh_endpoint, name);
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let response: DohResponse = agent
                .get(&url)
                .set("accept", "application/dns-json")
                .call()
                .context("DNS-over-HTTPS lookup failed")?
                .into_json()
                .context("Failed to parse DNS-over-HTTPS response")?;
            Ok(response
                .answer
                .into_iter()
                .map(|a| a.data.trim_matches('"').replace("\" \"", ""))
                .collect())
        })
        .await
        .context("DNS lookup task failed")?
    }

    async fn well_known(&self, base_url: &str) -> Result<Option<WellKnownDocument>> {
        let agent = self.agent.clone();
        let url = well_known_url(base_url)?;
        tokio::task::spawn_blocking(move || -> Result<Option<WellKnownDocument>> {
            match agent.get(&url).call() {
                Ok(resp) => {
                    let doc: WellKnownDocument = resp
                        .into_json()
                        .context("Failed to parse well-known authorization file")?;
                    Ok(Some(doc))
                }
                Err(ureq::Error::Status(404, _)) => Ok(None),
                Err(e) => Err(e).context("Failed to fetch well-known authorization file"),
            }
        })
        .await
        .context("Well-known lookup task failed")?
    }

    fn env_var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.trim().is_empty())
    }
}

fn well_known_url(base_url: &str) -> Result<String> {
    let url = url::Url::parse(base_url)
        .with_context(|| format!("Invalid target URL: {}", base_url))?;
    let origin = url.origin().ascii_serialization();
    Ok(format!("{}{}", origin, WELL_KNOWN_PATH))
}

/// Result of verifying a proof
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProofCheck {
    Valid { method: &'static str },
    Missing,
    Expired { method: &'static str },
    Invalid { method: &'static str, detail: String },
    /// The lookup itself failed; never retried
    Unverifiable { method: &'static str, detail: String },
}

impl ProofCheck {
    /// Reason string recorded with a DENY
    pub fn reason(&self) -> String {
        match self {
            ProofCheck::Valid { .. } => "authorized".to_string(),
            ProofCheck::Missing => "authorization_missing".to_string(),
            ProofCheck::Expired { .. } => "authorization_expired".to_string(),
            ProofCheck::Invalid { detail, .. } => format!("authorization_invalid: {}", detail),
            ProofCheck::Unverifiable { detail, .. } => {
                format!("authorization_unverifiable: {}", detail)
            }
        }
    }

    pub fn method(&self) -> Option<&'static str> {
        match self {
            ProofCheck::Valid { method }
            | ProofCheck::Expired { method }
            | ProofCheck::Invalid { method, .. }
            | ProofCheck::Unverifiable { method, .. } => Some(method),
            ProofCheck::Missing => None,
        }
    }
}

/// Parse `YYYY-MM-DD` (end of that day, UTC) or RFC 3339
pub fn parse_expiry(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(23, 59, 59))
        .map(|dt| dt.and_utc())
}

fn check_expiry(method: &'static str, expires: Option<&str>, now: DateTime<Utc>) -> Option<ProofCheck> {
    let raw = expires?;
    match parse_expiry(raw) {
        Some(at) if at <= now => Some(ProofCheck::Expired { method }),
        Some(_) => None,
        None => Some(ProofCheck::Invalid {
            method,
            detail: format!("unparseable expiry '{}'", raw),
        }),
    }
}

fn host_in_scope(host: &str, scope: &[String]) -> bool {
    scope.iter().any(|entry| {
        let entry = entry.trim().to_ascii_lowercase();
        let entry = url::Url::parse(&entry)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or(entry);
        // Wildcard scope entries cover subdomains only
        match entry.strip_prefix("*.") {
            Some(domain) => host.ends_with(&format!(".{}", domain)),
            None => host == entry,
        }
    })
}

/// Check the signed environment token
/// `v=testuniverse1;host=<host>;expires=<ts>;sig=<hex hmac of host|expires>`.
fn check_env_token(token: &str, host: Option<&str>, key: Option<&TokenKey>, now: DateTime<Utc>) -> ProofCheck {
    const METHOD: &str = "env_token";
    let invalid = |detail: String| ProofCheck::Invalid { method: METHOD, detail };

    let token = token.trim();
    if token.is_empty() {
        return ProofCheck::Missing;
    }
    if !token.contains('=') {
        return invalid("token is not in signed form".to_string());
    }

    let mut version = None;
    let mut token_host = None;
    let mut expires = None;
    let mut sig = None;
    for part in token.split(';') {
        match part.trim().split_once('=') {
            Some(("v", v)) => version = Some(format!("v={}", v.trim())),
            Some(("host", v)) => token_host = Some(v.trim().to_ascii_lowercase()),
            Some(("expires", v)) => expires = Some(v.trim().to_string()),
            Some(("sig", v)) => sig = Some(v.trim().to_string()),
            _ => {}
        }
    }

    if version.as_deref() != Some(DNS_RECORD_VERSION) {
        return invalid("unknown token version".to_string());
    }
    let Some(sig) = sig.filter(|s| !s.is_empty()) else {
        return invalid("token is not signed".to_string());
    };
    let Some(token_host) = token_host.filter(|h| !h.is_empty()) else {
        return invalid("token names no host".to_string());
    };
    match host {
        Some(host) if host.eq_ignore_ascii_case(&token_host) => {}
        Some(host) => return invalid(format!("token issued for {}, not {}", token_host, host)),
        None => return invalid("target has no host".to_string()),
    }
    let Some(key) = key else {
        return ProofCheck::Unverifiable {
            method: METHOD,
            detail: "no token verification key configured".to_string(),
        };
    };
    if !key.verify(&[&token_host, expires.as_deref().unwrap_or_default()], &sig) {
        return invalid("signature does not match".to_string());
    }
    if let Some(failure) = check_expiry(METHOD, expires.as_deref(), now) {
        return failure;
    }
    ProofCheck::Valid { method: METHOD }
}

/// Verify the target's authorization proof. Without a configured proof the
/// `TESTUNIVERSE_AUTH_PROOF` environment token is consulted; environment
/// tokens need `key` to check their signature.
pub async fn verify_proof(
    target: &Target,
    source: &dyn ProofSource,
    key: Option<&TokenKey>,
    now: DateTime<Utc>,
) -> ProofCheck {
    let host = target.host();

    let proof = match &target.authorization {
        Some(p) => p.clone(),
        None => match source.env_var(AUTH_PROOF_ENV) {
            Some(_) => AuthorizationProof::EnvToken {
                env: AUTH_PROOF_ENV.to_string(),
            },
            None => return ProofCheck::Missing,
        },
    };

    match proof {
        AuthorizationProof::DnsTxt { token } => {
            const METHOD: &str = "dns_txt";
            let Some(host) = host else {
                return ProofCheck::Invalid {
                    method: METHOD,
                    detail: "target has no host".to_string(),
                };
            };
            let name = format!("{}.{}", DNS_RECORD_PREFIX, host);
            match source.dns_txt(&name).await {
                Ok(records) => {
                    let expected = format!("auth={}", token);
                    let found = records.iter().any(|r| {
                        let mut parts = r.split_whitespace();
                        parts.next() == Some(DNS_RECORD_VERSION) && parts.any(|p| p == expected)
                    });
                    if found {
                        ProofCheck::Valid { method: METHOD }
                    } else {
                        ProofCheck::Invalid {
                            method: METHOD,
                            detail: format!("no matching TXT record at {}", name),
                        }
                    }
                }
                Err(e) => ProofCheck::Unverifiable {
                    method: METHOD,
                    detail: format!("{:#}", e),
                },
            }
        }
        AuthorizationProof::WellKnown => {
            const METHOD: &str = "well_known";
            let Some(host) = host else {
                return ProofCheck::Invalid {
                    method: METHOD,
                    detail: "target has no host".to_string(),
                };
            };
            match source.well_known(&target.url).await {
                Ok(Some(doc)) => {
                    if !doc.authorization.eq_ignore_ascii_case("granted") {
                        return ProofCheck::Invalid {
                            method: METHOD,
                            detail: format!("authorization is '{}'", doc.authorization),
                        };
                    }
                    if let Some(failure) = check_expiry(METHOD, doc.expires.as_deref(), now) {
                        return failure;
                    }
                    if !doc.scope.is_empty() && !host_in_scope(&host, &doc.scope) {
                        return ProofCheck::Invalid {
                            method: METHOD,
                            detail: format!("{} is not covered by the published scope", host),
                        };
                    }
                    ProofCheck::Valid { method: METHOD }
                }
                Ok(None) => ProofCheck::Missing,
                Err(e) => ProofCheck::Unverifiable {
                    method: METHOD,
                    detail: format!("{:#}", e),
                },
            }
        }
        AuthorizationProof::EnvToken { env } => match source.env_var(&env) {
            Some(token) => check_env_token(&token, host.as_deref(), key, now),
            None => ProofCheck::Missing,
        },
        AuthorizationProof::OwnerProof { proof, expires } => {
            const METHOD: &str = "owner_proof";
            if proof.trim().is_empty() {
                return ProofCheck::Missing;
            }
            if let Some(failure) = check_expiry(METHOD, expires.as_deref(), now) {
                return failure;
            }
            ProofCheck::Valid { method: METHOD }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TargetType;
    use crate::governance::signing::sign_env_token;
    use std::collections::HashMap;

    #[derive(Default)]
    struct StaticSource {
        txt: HashMap<String, Vec<String>>,
        well_known: Option<WellKnownDocument>,
        env: HashMap<String, String>,
        fail: bool,
    }

    #[async_trait]
    impl ProofSource for StaticSource {
        async fn dns_txt(&self, name: &str) -> Result<Vec<String>> {
            if self.fail {
                anyhow::bail!("resolver unreachable");
            }
            Ok(self.txt.get(name).cloned().unwrap_or_default())
        }

        async fn well_known(&self, _base_url: &str) -> Result<Option<WellKnownDocument>> {
            Ok(self.well_known.clone())
        }

        fn env_var(&self, name: &str) -> Option<String> {
            self.env.get(name).cloned()
        }
    }

    fn target() -> Target {
        Target::new("app", TargetType::Web, "https://staging.example.com")
    }

    fn now() -> DateTime<Utc> {
        parse_expiry("2025-06-01T00:00:00Z").unwrap()
    }

    #[tokio::test]
    async fn missing_proof_is_denied() {
        let check = verify_proof(&target(), &StaticSource::default(), None, now()).await;
        assert_eq!(check, ProofCheck::Missing);
        assert_eq!(check.reason(), "authorization_missing");
    }

    #[tokio::test]
    async fn dns_txt_record_must_carry_token() {
        let mut source = StaticSource::default();
        source.txt.insert(
            "_testuniverse.staging.example.com".into(),
            vec!["v=testuniverse1 auth=abc123".into()],
        );
        let t = target().with_authorization(AuthorizationProof::DnsTxt {
            token: "abc123".into(),
        });
        assert!(matches!(verify_proof(&t, &source, None, now()).await, ProofCheck::Valid { .. }));

        let wrong = target().with_authorization(AuthorizationProof::DnsTxt {
            token: "other".into(),
        });
        assert!(matches!(
            verify_proof(&wrong, &source, None, now()).await,
            ProofCheck::Invalid { .. }
        ));

        source.fail = true;
        let check = verify_proof(&t, &source, None, now()).await;
        assert!(check.reason().starts_with("authorization_unverifiable"));
    }

    #[tokio::test]
    async fn owner_proof_expiry() {
        let expired = target().with_authorization(AuthorizationProof::OwnerProof {
            proof: "signed".into(),
            expires: Some("2024-12-31".into()),
        });
        let check = verify_proof(&expired, &StaticSource::default(), None, now()).await;
        assert_eq!(check.reason(), "authorization_expired");

        let valid = target().with_authorization(AuthorizationProof::OwnerProof {
            proof: "signed".into(),
            expires: Some("2099-12-31".into()),
        });
        assert!(matches!(
            verify_proof(&valid, &StaticSource::default(), None, now()).await,
            ProofCheck::Valid { method: "owner_proof" }
        ));
    }

    #[tokio::test]
    async fn well_known_document_scope_and_expiry() {
        let mut source = StaticSource {
            well_known: Some(WellKnownDocument {
                authorization: "granted".into(),
                scope: vec!["staging.example.com".into()],
                expires: Some("2099-01-01".into()),
            }),
            ..Default::default()
        };
        let t = target().with_authorization(AuthorizationProof::WellKnown);
        assert!(matches!(verify_proof(&t, &source, None, now()).await, ProofCheck::Valid { .. }));

        source.well_known.as_mut().unwrap().scope = vec!["*.other.com".into()];
        assert!(matches!(verify_proof(&t, &source, None, now()).await, ProofCheck::Invalid { .. }));

        source.well_known = None;
        assert_eq!(verify_proof(&t, &source, None, now()).await, ProofCheck::Missing);
    }

    fn key() -> TokenKey {
        TokenKey::new("issuer-secret").unwrap()
    }

    async fn check_env(token: String, key: Option<&TokenKey>) -> ProofCheck {
        let mut source = StaticSource::default();
        source.env.insert(AUTH_PROOF_ENV.into(), token);
        verify_proof(&target(), &source, key, now()).await
    }

    #[tokio::test]
    async fn env_token_fallback() {
        let token = sign_env_token(&key(), "staging.example.com", Some("2099-01-01"));
        assert!(matches!(
            check_env(token.clone(), Some(&key())).await,
            ProofCheck::Valid { method: "env_token" }
        ));

        // Without a key the signature cannot be checked
        assert!(check_env(token, None).await.reason().starts_with("authorization_unverifiable"));

        let expired = sign_env_token(&key(), "staging.example.com", Some("2020-01-01"));
        assert_eq!(check_env(expired, Some(&key())).await.reason(), "authorization_expired");
    }

    #[tokio::test]
    async fn forged_env_tokens_are_rejected() {
        let forged = "v=testuniverse1;host=staging.example.com;expires=2099-01-01;sig=deadbeef".to_string();
        assert!(matches!(check_env(forged, Some(&key())).await, ProofCheck::Invalid { .. }));

        let other_key = sign_env_token(&TokenKey::new("someone-else").unwrap(), "staging.example.com", None);
        assert!(matches!(check_env(other_key, Some(&key())).await, ProofCheck::Invalid { .. }));

        // Stretching the expiry of a genuine token breaks its signature
        let genuine = sign_env_token(&key(), "staging.example.com", Some("2024-01-01"));
        let stretched = genuine.replace("2024-01-01", "2099-01-01");
        assert!(matches!(check_env(stretched, Some(&key())).await, ProofCheck::Invalid { .. }));

        let unsigned = "v=testuniverse1;host=staging.example.com".to_string();
        assert!(matches!(check_env(unsigned, Some(&key())).await, ProofCheck::Invalid { .. }));

        let bare = "opaque-token".to_string();
        assert!(matches!(check_env(bare, Some(&key())).await, ProofCheck::Invalid { .. }));
    }

    #[tokio::test]
    async fn env_token_for_another_host_is_rejected() {
        let token = sign_env_token(&key(), "prod.example.com", Some("2099-01-01"));
        match check_env(token, Some(&key())).await {
            ProofCheck::Invalid { detail, .. } => assert!(detail.contains("prod.example.com")),
            other => panic!("expected invalid, got {:?}", other),
        }
    }

    #[test]
    fn well_known_url_uses_origin() {
        assert_eq!(
            well_known_url("https://staging.example.com/app/login?x=1").unwrap(),
            "https://staging.example.com/.well-known/testuniverse.json"
        );
    }
}
