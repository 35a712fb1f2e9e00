#![forbid(unsafe_code)]

use checkview_contracts::identifier::{NonceId, TestIdentifier};
use checkview_contracts::nonce::{ClaimOutcome, NonceRecord};
use checkview_contracts::session::{TestConfiguration, TestKey, TestSessionRecord, VisitorAddress};
use checkview_contracts::UnixTimeMs;

use crate::audit::{AuditRow, AuditRowInput};
use crate::store::StorageError;

/// Typed repository interface for the consumed-nonce ledger.
///
/// `claim_nonce` must be a single insert-if-absent at the storage layer: two callers racing
/// on the same identifier see exactly one `Claimed`.
pub trait NonceLedgerRepo: Send + Sync {
    fn claim_nonce(
        &self,
        identifier: &NonceId,
        now: UnixTimeMs,
    ) -> Result<ClaimOutcome, StorageError>;

    /// Removes every record with `consumed_at < older_than`; returns how many went.
    fn purge_nonces(&self, older_than: UnixTimeMs) -> Result<u64, StorageError>;

    fn nonce_rows(&self) -> Result<Vec<NonceRecord>, StorageError>;
}

/// Typed repository interface for visitor/test correlation rows.
pub trait TestSessionRepo: Send + Sync {
    fn insert_test_session(&self, record: TestSessionRecord) -> Result<(), StorageError>;

    /// Most recently inserted row for the pair, if any.
    fn latest_test_session(
        &self,
        visitor_address: &VisitorAddress,
        test_identifier: &TestIdentifier,
    ) -> Result<Option<TestSessionRecord>, StorageError>;

    fn purge_test_sessions(&self, older_than: UnixTimeMs) -> Result<u64, StorageError>;
}

/// Typed repository interface for registered test configurations (last write wins).
pub trait TestConfigRepo: Send + Sync {
    fn upsert_test_config(&self, config: TestConfiguration) -> Result<(), StorageError>;
    fn get_test_config(&self, key: &TestKey) -> Result<Option<TestConfiguration>, StorageError>;
}

/// Typed repository interface for the operator audit log. Rows are never edited, only
/// appended and aged out.
pub trait AuditLogRepo: Send + Sync {
    fn append_audit_row(&self, input: AuditRowInput) -> Result<u64, StorageError>;
    fn audit_rows(&self) -> Result<Vec<AuditRow>, StorageError>;

    /// Removes every row with `at < older_than`; ids of surviving rows are unchanged.
    fn purge_audit_rows(&self, older_than: UnixTimeMs) -> Result<u64, StorageError>;
}

/// Everything the gate, resolver and cleanup cycle need from one backing store.
pub trait CheckviewStore: NonceLedgerRepo + TestSessionRepo + TestConfigRepo + AuditLogRepo {}

impl<T> CheckviewStore for T where
    T: NonceLedgerRepo + TestSessionRepo + TestConfigRepo + AuditLogRepo
{
}
