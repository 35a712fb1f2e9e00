#![forbid(unsafe_code)]

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use checkview_contracts::identifier::{NonceId, TestIdentifier};
use checkview_contracts::nonce::{ClaimOutcome, NonceRecord};
use checkview_contracts::session::{TestConfiguration, TestKey, TestSessionRecord, VisitorAddress};
use checkview_contracts::{ContractViolation, UnixTimeMs, Validate};

use crate::audit::{AuditRow, AuditRowInput};
use crate::repo::{AuditLogRepo, NonceLedgerRepo, TestConfigRepo, TestSessionRepo};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("contract violation: {0}")]
    ContractViolation(#[from] ContractViolation),
    #[error("{table} lock poisoned")]
    LockPoisoned { table: &'static str },
    #[error("{op} failed: {detail}")]
    Backend { op: &'static str, detail: String },
    #[error("{op} timed out")]
    Timeout { op: &'static str },
}

#[derive(Debug, Default)]
struct Tables {
    nonces: BTreeMap<NonceId, UnixTimeMs>,
    // insertion order is the recency order
    sessions: Vec<TestSessionRecord>,
    configs: BTreeMap<TestKey, TestConfiguration>,
    audit: Vec<AuditRow>,
    last_audit_id: u64,
}

/// Process-local store. The mutex is the uniqueness boundary for every table.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new_in_memory() -> Self {
        Self::default()
    }

    fn lock(&self, table: &'static str) -> Result<MutexGuard<'_, Tables>, StorageError> {
        self.tables
            .lock()
            .map_err(|_| StorageError::LockPoisoned { table })
    }
}

impl NonceLedgerRepo for InMemoryStore {
    fn claim_nonce(
        &self,
        identifier: &NonceId,
        now: UnixTimeMs,
    ) -> Result<ClaimOutcome, StorageError> {
        identifier.validate()?;
        let mut t = self.lock("cv_used_nonces")?;
        match t.nonces.entry(identifier.clone()) {
            Entry::Occupied(_) => Ok(ClaimOutcome::AlreadyClaimed),
            Entry::Vacant(slot) => {
                slot.insert(now);
                Ok(ClaimOutcome::Claimed)
            }
        }
    }

    fn purge_nonces(&self, older_than: UnixTimeMs) -> Result<u64, StorageError> {
        let mut t = self.lock("cv_used_nonces")?;
        let before = t.nonces.len();
        t.nonces.retain(|_, consumed_at| *consumed_at >= older_than);
        Ok((before - t.nonces.len()) as u64)
    }

    fn nonce_rows(&self) -> Result<Vec<NonceRecord>, StorageError> {
        let t = self.lock("cv_used_nonces")?;
        Ok(t.nonces
            .iter()
            .map(|(id, at)| NonceRecord::v1(id.clone(), *at))
            .collect())
    }
}

impl TestSessionRepo for InMemoryStore {
    fn insert_test_session(&self, record: TestSessionRecord) -> Result<(), StorageError> {
        record.visitor_address.validate()?;
        record.test_identifier.validate()?;
        self.lock("cv_sessions")?.sessions.push(record);
        Ok(())
    }

    fn latest_test_session(
        &self,
        visitor_address: &VisitorAddress,
        test_identifier: &TestIdentifier,
    ) -> Result<Option<TestSessionRecord>, StorageError> {
        let t = self.lock("cv_sessions")?;
        Ok(t.sessions
            .iter()
            .rev()
            .find(|r| &r.visitor_address == visitor_address && &r.test_identifier == test_identifier)
            .cloned())
    }

    fn purge_test_sessions(&self, older_than: UnixTimeMs) -> Result<u64, StorageError> {
        let mut t = self.lock("cv_sessions")?;
        let before = t.sessions.len();
        t.sessions.retain(|r| r.created_at >= older_than);
        Ok((before - t.sessions.len()) as u64)
    }
}

impl TestConfigRepo for InMemoryStore {
    fn upsert_test_config(&self, config: TestConfiguration) -> Result<(), StorageError> {
        config.validate()?;
        self.lock("cv_test_configs")?
            .configs
            .insert(config.test_key(), config);
        Ok(())
    }

    fn get_test_config(&self, key: &TestKey) -> Result<Option<TestConfiguration>, StorageError> {
        Ok(self.lock("cv_test_configs")?.configs.get(key).cloned())
    }
}

impl AuditLogRepo for InMemoryStore {
    fn append_audit_row(&self, input: AuditRowInput) -> Result<u64, StorageError> {
        let mut t = self.lock("cv_audit_log")?;
        t.last_audit_id += 1;
        let audit_id = t.last_audit_id;
        t.audit.push(AuditRow {
            audit_id,
            at: input.at,
            channel: input.channel,
            reason_code: input.reason_code,
            message: input.message,
        });
        Ok(audit_id)
    }

    fn audit_rows(&self) -> Result<Vec<AuditRow>, StorageError> {
        Ok(self.lock("cv_audit_log")?.audit.clone())
    }

    fn purge_audit_rows(&self, older_than: UnixTimeMs) -> Result<u64, StorageError> {
        let mut t = self.lock("cv_audit_log")?;
        let before = t.audit.len();
        t.audit.retain(|r| r.at >= older_than);
        Ok((before - t.audit.len()) as u64)
    }
}
