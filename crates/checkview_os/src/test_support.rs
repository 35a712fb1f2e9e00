#![forbid(unsafe_code)]

use checkview_contracts::identifier::{NonceId, TestIdentifier};
use checkview_contracts::nonce::{ClaimOutcome, NonceRecord};
use checkview_contracts::session::{TestConfiguration, TestKey, TestSessionRecord, VisitorAddress};
use checkview_contracts::UnixTimeMs;
use checkview_storage::audit::{AuditRow, AuditRowInput};
use checkview_storage::repo::{AuditLogRepo, NonceLedgerRepo, TestConfigRepo, TestSessionRepo};
use checkview_storage::StorageError;

/// Every call fails the way a locked or unreachable database does.
pub(crate) struct UnavailableStore;

fn down(op: &'static str) -> StorageError {
    StorageError::Backend {
        op,
        detail: "database is locked".to_string(),
    }
}

impl NonceLedgerRepo for UnavailableStore {
    fn claim_nonce(&self, _: &NonceId, _: UnixTimeMs) -> Result<ClaimOutcome, StorageError> {
        Err(down("claim_nonce"))
    }
    fn purge_nonces(&self, _: UnixTimeMs) -> Result<u64, StorageError> {
        Err(down("purge_nonces"))
    }
    fn nonce_rows(&self) -> Result<Vec<NonceRecord>, StorageError> {
        Err(down("nonce_rows"))
    }
}

impl TestSessionRepo for UnavailableStore {
    fn insert_test_session(&self, _: TestSessionRecord) -> Result<(), StorageError> {
        Err(down("insert_test_session"))
    }
    fn latest_test_session(
        &self,
        _: &VisitorAddress,
        _: &TestIdentifier,
    ) -> Result<Option<TestSessionRecord>, StorageError> {
        Err(down("latest_test_session"))
    }
    fn purge_test_sessions(&self, _: UnixTimeMs) -> Result<u64, StorageError> {
        Err(down("purge_test_sessions"))
    }
}

impl TestConfigRepo for UnavailableStore {
    fn upsert_test_config(&self, _: TestConfiguration) -> Result<(), StorageError> {
        Err(down("upsert_test_config"))
    }
    fn get_test_config(&self, _: &TestKey) -> Result<Option<TestConfiguration>, StorageError> {
        Err(down("get_test_config"))
    }
}

impl AuditLogRepo for UnavailableStore {
    fn append_audit_row(&self, _: AuditRowInput) -> Result<u64, StorageError> {
        Err(down("append_audit_row"))
    }
    fn audit_rows(&self) -> Result<Vec<AuditRow>, StorageError> {
        Err(down("audit_rows"))
    }
    fn purge_audit_rows(&self, _: UnixTimeMs) -> Result<u64, StorageError> {
        Err(down("purge_audit_rows"))
    }
}
