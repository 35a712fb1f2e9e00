#![forbid(unsafe_code)]

use crate::identifier::NonceId;
use crate::{ReasonCodeId, UnixTimeMs};

/// The only message a denied caller ever sees.
pub const CLIENT_DENIAL_MESSAGE: &str = "Invalid request.";

pub mod reason_codes {
    use crate::ReasonCodeId;

    pub const GATE_OK_ADMITTED: ReasonCodeId = ReasonCodeId(0xC700_0001);
    pub const GATE_DENY_AUTH_MISSING: ReasonCodeId = ReasonCodeId(0xC700_00F1);
    pub const GATE_DENY_INSECURE_TRANSPORT: ReasonCodeId = ReasonCodeId(0xC700_00F2);
    pub const GATE_DENY_INVALID_TOKEN: ReasonCodeId = ReasonCodeId(0xC700_00F3);
    pub const GATE_DENY_MALFORMED_IDENTIFIER: ReasonCodeId = ReasonCodeId(0xC700_00F4);
    pub const GATE_DENY_REPLAYED_TOKEN: ReasonCodeId = ReasonCodeId(0xC700_00F5);
    pub const GATE_DENY_STORE_ERROR: ReasonCodeId = ReasonCodeId(0xC700_00F6);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportSecurity {
    Encrypted,
    Plaintext,
}

/// What the gate needs to see of an inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateRequest<'a> {
    pub authorization: Option<&'a str>,
    pub transport: TransportSecurity,
    pub now: UnixTimeMs,
}

/// Proof that a request passed the gate and its nonce is durably claimed.
///
/// Only the gate constructs this; handlers require a reference to it to prove ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admitted {
    nonce: NonceId,
    claimed_at: UnixTimeMs,
}

impl Admitted {
    #[doc(hidden)]
    pub fn after_claim(nonce: NonceId, claimed_at: UnixTimeMs) -> Self {
        Self { nonce, claimed_at }
    }

    pub fn nonce(&self) -> &NonceId {
        &self.nonce
    }

    pub fn claimed_at(&self) -> UnixTimeMs {
        self.claimed_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenValidationError {
    #[error("credential is not a three-part compact token")]
    Malformed,
    #[error("token segment is not valid base64url: {segment}")]
    Encoding { segment: &'static str },
    #[error("token header or claims are not valid JSON: {0}")]
    Json(String),
    #[error("unsupported signing algorithm {0}")]
    UnsupportedAlgorithm(String),
    #[error("signature mismatch")]
    BadSignature,
    #[error("token expired at {expired_at_s}")]
    Expired { expired_at_s: u64 },
    #[error("token not valid before {not_before_s}")]
    NotYetValid { not_before_s: u64 },
    #[error("token carries no nonce claim")]
    MissingNonce,
}

/// Boundary to whatever decodes and verifies the bearer credential.
///
/// A successful result is only trusted to be a non-empty string; its format is checked
/// by the caller.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, credential: &str, now: UnixTimeMs) -> Result<String, TokenValidationError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateDenial {
    #[error("Empty Auth header.")]
    AuthMissing,
    #[error("Insecure request blocked.")]
    InsecureTransport,
    #[error("Invalid token.")]
    InvalidToken(Option<TokenValidationError>),
    #[error("Invalid nonce format.")]
    MalformedIdentifier,
    #[error("This nonce has already been used.")]
    ReplayedToken,
    #[error("Not able to add nonce.")]
    StoreError { detail: String },
}

impl GateDenial {
    pub fn reason_code(&self) -> ReasonCodeId {
        match self {
            GateDenial::AuthMissing => reason_codes::GATE_DENY_AUTH_MISSING,
            GateDenial::InsecureTransport => reason_codes::GATE_DENY_INSECURE_TRANSPORT,
            GateDenial::InvalidToken(_) => reason_codes::GATE_DENY_INVALID_TOKEN,
            GateDenial::MalformedIdentifier => reason_codes::GATE_DENY_MALFORMED_IDENTIFIER,
            GateDenial::ReplayedToken => reason_codes::GATE_DENY_REPLAYED_TOKEN,
            GateDenial::StoreError { .. } => reason_codes::GATE_DENY_STORE_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GateDenial::AuthMissing => "AUTH_MISSING",
            GateDenial::InsecureTransport => "INSECURE_TRANSPORT",
            GateDenial::InvalidToken(_) => "INVALID_TOKEN",
            GateDenial::MalformedIdentifier => "MALFORMED_IDENTIFIER",
            GateDenial::ReplayedToken => "REPLAYED_TOKEN",
            GateDenial::StoreError { .. } => "STORE_ERROR",
        }
    }

    /// Status code on the wire. Only 400 and 403 are used so the code carries no more
    /// than "authentication failed" or "identifier refused".
    pub fn http_status(&self) -> u16 {
        match self {
            GateDenial::AuthMissing
            | GateDenial::InsecureTransport
            | GateDenial::InvalidToken(_)
            | GateDenial::StoreError { .. } => 400,
            GateDenial::MalformedIdentifier | GateDenial::ReplayedToken => 403,
        }
    }

    pub fn client_message(&self) -> &'static str {
        CLIENT_DENIAL_MESSAGE
    }

    /// Audit text, including the validator's detail where there is one.
    pub fn audit_message(&self) -> String {
        match self {
            GateDenial::InvalidToken(Some(err)) => format!("{self} {err}"),
            GateDenial::StoreError { detail } => format!("{self} {detail}"),
            _ => self.to_string(),
        }
    }
}
