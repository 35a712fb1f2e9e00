#![forbid(unsafe_code)]

use checkview_contracts::{ReasonCodeId, UnixTimeMs};

use crate::repo::AuditLogRepo;
use crate::store::StorageError;

const MAX_AUDIT_MESSAGE_BYTES: usize = 512;

/// Audit rows older than this are dropped by the cleanup cycle.
pub const AUDIT_RETENTION_MS: u64 = 30 * 24 * 60 * 60 * 1_000;

/// Oldest `at` that survives an audit purge run at `now`.
pub fn audit_purge_cutoff(now: UnixTimeMs) -> UnixTimeMs {
    now.saturating_sub_ms(AUDIT_RETENTION_MS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditChannel {
    /// Operator log for API authentication and registration outcomes.
    ApiLogs,
    /// Outcomes of the nonce/session cleanup cycle.
    Cleanup,
}

impl AuditChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditChannel::ApiLogs => "api-logs",
            AuditChannel::Cleanup => "cleanup",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "api-logs" => Some(AuditChannel::ApiLogs),
            "cleanup" => Some(AuditChannel::Cleanup),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRowInput {
    pub at: UnixTimeMs,
    pub channel: AuditChannel,
    pub reason_code: ReasonCodeId,
    pub message: String,
}

impl AuditRowInput {
    pub fn v1(
        at: UnixTimeMs,
        channel: AuditChannel,
        reason_code: ReasonCodeId,
        message: impl Into<String>,
    ) -> Self {
        Self {
            at,
            channel,
            reason_code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRow {
    pub audit_id: u64,
    pub at: UnixTimeMs,
    pub channel: AuditChannel,
    pub reason_code: ReasonCodeId,
    pub message: String,
}

/// Writer into whichever store backs the audit log.
#[derive(Debug, Default)]
pub struct AuditRuntime;

impl AuditRuntime {
    pub fn emit<S: AuditLogRepo + ?Sized>(
        store: &S,
        mut input: AuditRowInput,
    ) -> Result<u64, StorageError> {
        input.message = clamp_message(input.message.trim());
        store.append_audit_row(input)
    }
}

fn clamp_message(msg: &str) -> String {
    if msg.len() <= MAX_AUDIT_MESSAGE_BYTES {
        return msg.to_string();
    }
    let mut end = MAX_AUDIT_MESSAGE_BYTES;
    while !msg.is_char_boundary(end) {
        end -= 1;
    }
    msg[..end].to_string()
}
