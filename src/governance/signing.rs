//! HMAC-SHA256 signatures for authorization and Attack Mode tokens
//!
//! Tokens are `key=value` pairs separated by `;`. The `sig` field is the
//! hex-encoded HMAC of the token's bound fields joined with `|`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Shared secret used to verify signed tokens
#[derive(Clone)]
pub struct TokenKey(Vec<u8>);

impl TokenKey {
    pub fn new(secret: impl AsRef<[u8]>) -> Option<Self> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return None;
        }
        Some(Self(secret.to_vec()))
    }

    fn mac(&self, fields: &[&str]) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(&self.0).expect("hmac accepts any key length");
        mac.update(fields.join("|").as_bytes());
        mac
    }

    /// Hex signature over `fields`
    pub fn sign(&self, fields: &[&str]) -> String {
        hex::encode(self.mac(fields).finalize().into_bytes())
    }

    /// Constant-time check of a hex signature
    pub fn verify(&self, fields: &[&str], sig: &str) -> bool {
        match hex::decode(sig.trim()) {
            Ok(raw) => self.mac(fields).verify_slice(&raw).is_ok(),
            Err(_) => false,
        }
    }
}

impl std::fmt::Debug for TokenKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenKey(<redacted>)")
    }
}

/// Mint an environment authorization token for `host`
pub fn sign_env_token(key: &TokenKey, host: &str, expires: Option<&str>) -> String {
    let host = host.trim().to_ascii_lowercase();
    let expires = expires.unwrap_or_default();
    let sig = key.sign(&[&host, expires]);
    let mut token = format!("{};host={}", super::authorization::DNS_RECORD_VERSION, host);
    if !expires.is_empty() {
        token.push_str(&format!(";expires={}", expires));
    }
    format!("{};sig={}", token, sig)
}

/// Mint a pre-approved Attack Mode token
pub fn sign_approval_token(key: &TokenKey, scope: &[&str], expires: Option<&str>, approver: Option<&str>) -> String {
    let scope: Vec<String> = scope.iter().map(|h| h.trim().to_ascii_lowercase()).collect();
    let scope = scope.join(",");
    let expires = expires.unwrap_or_default();
    let approver = approver.unwrap_or_default();
    let sig = key.sign(&[&scope, expires, approver]);

    let mut token = format!("{};scope={}", super::authorization::DNS_RECORD_VERSION, scope);
    if !expires.is_empty() {
        token.push_str(&format!(";expires={}", expires));
    }
    if !approver.is_empty() {
        token.push_str(&format!(";approver={}", approver));
    }
    format!("{};sig={}", token, sig)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_bind_every_field() {
        let key = TokenKey::new("s3cret").unwrap();
        let sig = key.sign(&["shop.example", "2099-01-01"]);
        assert_eq!(sig.len(), 64);
        assert!(key.verify(&["shop.example", "2099-01-01"], &sig));
        assert!(!key.verify(&["other.example", "2099-01-01"], &sig));
        assert!(!key.verify(&["shop.example", "2100-01-01"], &sig));
        assert!(!TokenKey::new("other").unwrap().verify(&["shop.example", "2099-01-01"], &sig));
        assert!(!key.verify(&["shop.example", "2099-01-01"], "not-hex"));
    }

    #[test]
    fn empty_secret_is_no_key() {
        assert!(TokenKey::new("").is_none());
        assert_eq!(format!("{:?}", TokenKey::new("x").unwrap()), "TokenKey(<redacted>)");
    }
}
