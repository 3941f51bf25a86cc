//! Compact bearer tokens.
//!
//! Wire form is three dot-joined segments: a text-codec-encrypted JSON
//! header (already URL-safe by the codec's alphabet), a URL-safe base64 JSON
//! payload, and an HMAC-SHA1 signature over `"header.payload"` keyed by the
//! module secret. Verification recomputes the signature first; an expired or
//! not-yet-valid window clears the `auth` flag but still returns the token
//! so callers decide what a stale credential means.

use std::sync::RwLock;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::Utc;
use eyre::{eyre, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::defs::{self, Map};
use crate::kernel::{Module, Registry};
use crate::utils::{hmac_sign, hmac_verify};

pub static TOKEN: Lazy<TokenModule> = Lazy::new(TokenModule::new);

#[derive(Clone)]
pub struct TokenConfig {
    pub secret: String,
    pub expiry: Option<Duration>,
}

impl Default for TokenConfig {
    fn default() -> Self {
        TokenConfig { secret: "strata".into(), expiry: None }
    }
}

/// Token header with compact wire keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenHeader {
    /// Identity of the credential.
    #[serde(rename = "d", default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Validity window start, unix seconds; 0 means unbounded.
    #[serde(rename = "b", default, skip_serializing_if = "is_zero")]
    pub begin: i64,
    /// Validity window end, unix seconds; 0 means unbounded.
    #[serde(rename = "e", default, skip_serializing_if = "is_zero")]
    pub end: i64,
    /// Whether the bearer is authenticated.
    #[serde(rename = "a", default, skip_serializing_if = "std::ops::Not::not")]
    pub auth: bool,
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Token {
    pub header: TokenHeader,
    pub payload: Map,
}

pub struct TokenModule {
    config: RwLock<TokenConfig>,
}

impl TokenModule {
    pub fn new() -> TokenModule {
        TokenModule { config: RwLock::new(TokenConfig::default()) }
    }

    pub fn config(&self) -> TokenConfig {
        self.config.read().unwrap().clone()
    }

    pub fn sign(&self, token: &Token) -> Result<String> {
        let secret = self.config.read().unwrap().secret.clone();

        let header_json = serde_json::to_string(&token.header)?;
        let header = codec::encrypt_text(&header_json)?;

        let payload_json = serde_json::to_vec(&token.payload)?;
        let payload = URL_SAFE.encode(payload_json);

        let signed = format!("{header}.{payload}");
        let sign = hmac_sign(&signed, &secret)?;

        Ok(format!("{signed}.{sign}"))
    }

    pub fn verify(&self, text: &str) -> Result<Token> {
        let secret = self.config.read().unwrap().secret.clone();

        let parts: Vec<&str> = text.split('.').collect();
        let [header, payload, sign] = parts.as_slice() else {
            return Err(eyre!("invalid token"));
        };

        hmac_verify(&format!("{header}.{payload}"), sign, &secret)
            .map_err(|_| eyre!("invalid token"))?;

        let header_json = codec::decrypt_text(header)?;
        let header: TokenHeader = serde_json::from_str(&header_json)?;

        let payload_bytes = URL_SAFE.decode(payload)?;
        let payload: Map = serde_json::from_slice(&payload_bytes)?;

        let mut token = Token { header, payload };

        let now = Utc::now().timestamp();
        if token.header.begin > 0 && now < token.header.begin {
            token.header.auth = false;
        }
        if token.header.end > 0 && now > token.header.end {
            token.header.auth = false;
        }

        Ok(token)
    }
}

impl Default for TokenModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Module for TokenModule {
    fn name(&self) -> &'static str {
        "token"
    }

    fn register(&self, _name: &str, _value: &Registry, _overwrite: bool) {}

    fn configure(&self, config: &Map) {
        let Some(section) = defs::get_map(config, "token") else {
            return;
        };
        let mut cfg = self.config.write().unwrap();
        if let Some(secret) = defs::get_str(section, "secret") {
            cfg.secret = secret;
        }
        if let Some(expiry) = defs::get_duration(section, "expiry") {
            cfg.expiry = Some(expiry);
        }
    }
}

/// Mint and sign a token: a fresh id, the given auth flag and payload, and
/// an optional validity window from now.
pub fn issue(auth: bool, payload: Map, expiry: Option<Duration>) -> String {
    let mut token = Token { payload, ..Token::default() };
    token.header.id = codec::generate("");
    token.header.auth = auth;

    let expiry = expiry.or(TOKEN.config().expiry);
    if let Some(expiry) = expiry {
        token.header.end = Utc::now().timestamp() + expiry.as_secs() as i64;
    }

    TOKEN.sign(&token).unwrap_or_default()
}

pub fn sign(token: &Token) -> Result<String> {
    TOKEN.sign(token)
}

pub fn verify(text: &str) -> Result<Token> {
    TOKEN.verify(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map;
    use serde_json::json;

    fn setup() {
        crate::result::builtin();
        codec::builtin();
    }

    #[test]
    fn roundtrip_preserves_header_and_payload() {
        setup();
        let token = Token {
            header: TokenHeader { id: "u1".into(), begin: 0, end: 0, auth: true },
            payload: map! { "k" => "v", "n" => 3 },
        };

        let wire = sign(&token).unwrap();
        assert_eq!(wire.split('.').count(), 3);

        let back = verify(&wire).unwrap();
        assert_eq!(back.header, token.header);
        assert_eq!(back.payload, token.payload);
    }

    #[test]
    fn mutation_of_any_segment_rejects() {
        setup();
        let token = Token {
            header: TokenHeader { id: "u1".into(), auth: true, ..TokenHeader::default() },
            payload: map! { "k" => "v" },
        };
        let wire = sign(&token).unwrap();

        for at in [0, wire.find('.').unwrap() + 1, wire.rfind('.').unwrap() + 1] {
            let mut bytes = wire.clone().into_bytes();
            bytes[at] = if bytes[at] == b'A' { b'B' } else { b'A' };
            let mutated = String::from_utf8(bytes).unwrap();
            assert!(verify(&mutated).is_err(), "mutation at {at} accepted");
        }

        assert!(verify("only.two").is_err());
    }

    #[test]
    fn expired_window_clears_auth_but_returns_token() {
        setup();
        let now = Utc::now().timestamp();
        let token = Token {
            header: TokenHeader { id: "u1".into(), begin: 0, end: now - 10, auth: true },
            payload: map! { "k" => json!(1) },
        };

        let back = verify(&sign(&token).unwrap()).unwrap();
        assert!(!back.header.auth);
        assert_eq!(back.header.id, "u1");
        assert_eq!(back.payload, token.payload);
    }

    #[test]
    fn future_begin_clears_auth() {
        setup();
        let now = Utc::now().timestamp();
        let token = Token {
            header: TokenHeader {
                id: "u1".into(),
                begin: now + 1000,
                end: 0,
                auth: true,
            },
            payload: Map::new(),
        };
        let back = verify(&sign(&token).unwrap()).unwrap();
        assert!(!back.header.auth);
    }

    #[test]
    fn issue_produces_verifiable_tokens() {
        setup();
        let wire = issue(true, map! { "role" => "admin" }, Some(Duration::from_secs(60)));
        let token = verify(&wire).unwrap();
        assert!(token.header.auth);
        assert!(!token.header.id.is_empty());
        assert!(token.header.end > Utc::now().timestamp());
        assert_eq!(token.payload.get("role"), Some(&json!("admin")));
    }
}
