#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::identifier::NonceId;
use crate::UnixTimeMs;

/// Consumed nonces are kept this long before the cleanup sweep may drop them.
pub const NONCE_RETENTION_MS: u64 = 24 * 60 * 60 * 1_000;

/// Oldest `consumed_at` that survives a purge run at `now`.
pub fn nonce_purge_cutoff(now: UnixTimeMs) -> UnixTimeMs {
    now.saturating_sub_ms(NONCE_RETENTION_MS)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceRecord {
    pub identifier: NonceId,
    pub consumed_at: UnixTimeMs,
}

impl NonceRecord {
    pub fn v1(identifier: NonceId, consumed_at: UnixTimeMs) -> Self {
        Self {
            identifier,
            consumed_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClaimOutcome {
    Claimed,
    AlreadyClaimed,
}
