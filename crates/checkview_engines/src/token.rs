#![forbid(unsafe_code)]

use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64URL;
use base64::Engine;
use checkview_contracts::gate::{TokenValidationError, TokenValidator};
use checkview_contracts::UnixTimeMs;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const ALG_HS256: &str = "HS256";
pub const DEFAULT_LEEWAY_S: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenHeader {
    alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    typ: Option<String>,
}

/// Claims the validator reads. Anything else in the payload is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<u64>,
}

impl NonceClaims {
    pub fn with_nonce(nonce: impl Into<String>) -> Self {
        Self {
            nonce: Some(nonce.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenKeyError {
    #[error("token secret must not be empty")]
    EmptySecret,
    #[error("token secret rejected by hmac")]
    InvalidKey,
    #[error("token encode failed: {0}")]
    Encode(String),
}

/// Verifies compact HS256 tokens and returns their `nonce` claim.
#[derive(Clone)]
pub struct Hs256TokenValidator {
    secret: Vec<u8>,
    leeway_s: u64,
}

impl std::fmt::Debug for Hs256TokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hs256TokenValidator")
            .field("secret", &"<redacted>")
            .field("leeway_s", &self.leeway_s)
            .finish()
    }
}

impl Hs256TokenValidator {
    pub fn new(secret: impl Into<Vec<u8>>) -> Result<Self, TokenKeyError> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(TokenKeyError::EmptySecret);
        }
        Ok(Self {
            secret,
            leeway_s: DEFAULT_LEEWAY_S,
        })
    }

    pub fn with_leeway_s(mut self, leeway_s: u64) -> Self {
        self.leeway_s = leeway_s;
        self
    }
}

fn strip_bearer(credential: &str) -> &str {
    let c = credential.trim();
    match c.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => c[7..].trim_start(),
        _ => c,
    }
}

fn decode_segment(segment: &'static str, raw: &str) -> Result<Vec<u8>, TokenValidationError> {
    B64URL
        .decode(raw)
        .map_err(|_| TokenValidationError::Encoding { segment })
}

impl TokenValidator for Hs256TokenValidator {
    fn validate(&self, credential: &str, now: UnixTimeMs) -> Result<String, TokenValidationError> {
        let token = strip_bearer(credential);
        let mut parts = token.split('.');
        let (header_b64, payload_b64, sig_b64) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(h), Some(p), Some(s), None) if !h.is_empty() && !p.is_empty() => (h, p, s),
                _ => return Err(TokenValidationError::Malformed),
            };

        let header: TokenHeader = serde_json::from_slice(&decode_segment("header", header_b64)?)
            .map_err(|e| TokenValidationError::Json(e.to_string()))?;
        if header.alg != ALG_HS256 {
            return Err(TokenValidationError::UnsupportedAlgorithm(header.alg));
        }

        let signature = decode_segment("signature", sig_b64)?;
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| TokenValidationError::BadSignature)?;
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(payload_b64.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenValidationError::BadSignature)?;

        let claims: NonceClaims = serde_json::from_slice(&decode_segment("payload", payload_b64)?)
            .map_err(|e| TokenValidationError::Json(e.to_string()))?;

        let now_s = now.as_secs();
        if let Some(exp) = claims.exp {
            if now_s > exp.saturating_add(self.leeway_s) {
                return Err(TokenValidationError::Expired { expired_at_s: exp });
            }
        }
        if let Some(nbf) = claims.nbf {
            if now_s.saturating_add(self.leeway_s) < nbf {
                return Err(TokenValidationError::NotYetValid { not_before_s: nbf });
            }
        }

        match claims.nonce {
            Some(nonce) if !nonce.trim().is_empty() => Ok(nonce.trim().to_string()),
            _ => Err(TokenValidationError::MissingNonce),
        }
    }
}

/// Issues a token the validator accepts. Issuance normally happens on the SaaS side; this
/// exists for operator tooling and tests.
pub fn encode_hs256(secret: &[u8], claims: &NonceClaims) -> Result<String, TokenKeyError> {
    if secret.is_empty() {
        return Err(TokenKeyError::EmptySecret);
    }
    let header = TokenHeader {
        alg: ALG_HS256.to_string(),
        typ: Some("JWT".to_string()),
    };
    let header_b64 =
        B64URL.encode(serde_json::to_vec(&header).map_err(|e| TokenKeyError::Encode(e.to_string()))?);
    let payload_b64 =
        B64URL.encode(serde_json::to_vec(claims).map_err(|e| TokenKeyError::Encode(e.to_string()))?);
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| TokenKeyError::InvalidKey)?;
    mac.update(header_b64.as_bytes());
    mac.update(b".");
    mac.update(payload_b64.as_bytes());
    let sig_b64 = B64URL.encode(mac.finalize().into_bytes());
    Ok(format!("{header_b64}.{payload_b64}.{sig_b64}"))
}
