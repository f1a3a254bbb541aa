//! Target definitions - the system under test and its access metadata

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

static TARGET_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9-]+$").expect("valid regex"));

/// Kind of system under test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Web,
    Api,
    Repo,
    Mobile,
    Cli,
    Infra,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Web => "web",
            TargetType::Api => "api",
            TargetType::Repo => "repo",
            TargetType::Mobile => "mobile",
            TargetType::Cli => "cli",
            TargetType::Infra => "infra",
        }
    }

    /// Whether targets of this type are reached over HTTP(S)
    pub fn is_networked(&self) -> bool {
        matches!(self, TargetType::Web | TargetType::Api)
    }
}

/// Credentials descriptor. Secrets are only ever referenced by env var name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthDescriptor {
    Bearer {
        token_env: String,
    },
    Basic {
        username_env: String,
        password_env: String,
    },
    Cookie {
        cookie_env: String,
    },
    Oauth2 {
        client_id_env: String,
        client_secret_env: String,
        token_url: String,
    },
    Custom {
        #[serde(default)]
        script: Option<String>,
        #[serde(default)]
        env: Vec<String>,
    },
}

impl AuthDescriptor {
    /// Environment variables this descriptor forwards into sandboxes
    pub fn env_vars(&self) -> Vec<&str> {
        match self {
            AuthDescriptor::Bearer { token_env } => vec![token_env.as_str()],
            AuthDescriptor::Basic {
                username_env,
                password_env,
            } => vec![username_env.as_str(), password_env.as_str()],
            AuthDescriptor::Cookie { cookie_env } => vec![cookie_env.as_str()],
            AuthDescriptor::Oauth2 {
                client_id_env,
                client_secret_env,
                ..
            } => vec![client_id_env.as_str(), client_secret_env.as_str()],
            AuthDescriptor::Custom { env, .. } => env.iter().map(String::as_str).collect(),
        }
    }
}

/// Proof that the operator is allowed to test the target
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AuthorizationProof {
    /// `_testuniverse.<host> TXT "v=testuniverse1 auth=<token>"`
    DnsTxt { token: String },
    /// `/.well-known/testuniverse.json` served by the target
    WellKnown,
    /// Signed token handed in through the environment
    EnvToken {
        #[serde(default = "default_proof_env")]
        env: String,
    },
    /// Owner-issued proof stored with the target configuration
    OwnerProof {
        proof: String,
        #[serde(default)]
        expires: Option<String>,
    },
}

pub(crate) fn default_proof_env() -> String {
    "TESTUNIVERSE_AUTH_PROOF".to_string()
}

/// URL scope restrictions for a target
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeRules {
    /// Glob patterns a URL must match (empty means "anything not excluded")
    #[serde(default)]
    pub include: Vec<String>,
    /// Glob patterns that always block, even when included
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Only allow the target's own host
    #[serde(default)]
    pub same_origin: bool,
    /// Explicit host allowlist (empty means no host restriction)
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    /// Allowed URL schemes (empty means http and https)
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub max_depth: Option<u32>,
    #[serde(default)]
    pub max_pages: Option<u32>,
}

/// The system under test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: String,

    #[serde(rename = "type")]
    pub target_type: TargetType,

    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthDescriptor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<AuthorizationProof>,

    #[serde(default)]
    pub scope: ScopeRules,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Target {
    pub fn new(id: impl Into<String>, target_type: TargetType, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            target_type,
            url: url.into(),
            name: None,
            auth: None,
            authorization: None,
            scope: ScopeRules::default(),
            headers: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_authorization(mut self, proof: AuthorizationProof) -> Self {
        self.authorization = Some(proof);
        self
    }

    pub fn with_scope(mut self, scope: ScopeRules) -> Self {
        self.scope = scope;
        self
    }

    /// Parsed target URL, if it is a URL at all (repo/cli targets may be paths)
    pub fn parsed_url(&self) -> Option<Url> {
        Url::parse(&self.url).ok()
    }

    /// Lower-cased host of the target URL
    pub fn host(&self) -> Option<String> {
        self.parsed_url()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
    }

    /// Check the structural constraints a target must meet before a run starts
    pub fn validate(&self) -> Result<(), String> {
        if !TARGET_ID_RE.is_match(&self.id) {
            return Err(format!(
                "target id '{}' must match ^[a-z0-9-]+$",
                self.id
            ));
        }
        if self.url.trim().is_empty() {
            return Err("target url is required".to_string());
        }
        if self.target_type.is_networked() {
            let url = Url::parse(&self.url)
                .map_err(|e| format!("target url '{}' is not a valid URL: {}", self.url, e))?;
            if url.host_str().is_none() {
                return Err(format!("target url '{}' has no host", self.url));
            }
        }
        Ok(())
    }
}
