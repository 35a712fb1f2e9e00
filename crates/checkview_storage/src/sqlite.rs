#![forbid(unsafe_code)]

//! SQLite-backed store.
//!
//! Nonce uniqueness is the `cv_used_nonces` primary key: a claim is one `INSERT` and a
//! constraint violation is the "already claimed" answer. There is no read before the write.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use checkview_contracts::identifier::{NonceId, TestIdentifier};
use checkview_contracts::nonce::{ClaimOutcome, NonceRecord};
use checkview_contracts::session::{TestConfiguration, TestKey, TestSessionRecord, VisitorAddress};
use checkview_contracts::{ReasonCodeId, UnixTimeMs, Validate};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use crate::audit::{AuditChannel, AuditRow, AuditRowInput};
use crate::repo::{AuditLogRepo, NonceLedgerRepo, TestConfigRepo, TestSessionRepo};
use crate::store::StorageError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cv_used_nonces (
    nonce TEXT PRIMARY KEY NOT NULL,
    used_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cv_used_nonces_used_at ON cv_used_nonces (used_at_ms);

CREATE TABLE IF NOT EXISTS cv_sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    visitor_ip TEXT NOT NULL,
    test_id TEXT NOT NULL,
    test_key TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cv_sessions_pair ON cv_sessions (visitor_ip, test_id);
CREATE INDEX IF NOT EXISTS idx_cv_sessions_created_at ON cv_sessions (created_at_ms);

CREATE TABLE IF NOT EXISTS cv_test_configs (
    test_key TEXT PRIMARY KEY NOT NULL,
    config_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cv_audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    at_ms INTEGER NOT NULL,
    channel TEXT NOT NULL,
    reason_code INTEGER NOT NULL,
    message TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cv_audit_log_at ON cv_audit_log (at_ms);
";

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(2_000);

#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (or creates) the database file. `busy_timeout` bounds how long a write waits
    /// on another connection's lock before failing with a store error.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, StorageError> {
        let conn = Connection::open(path).map_err(backend("open"))?;
        Self::init(conn, busy_timeout)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(backend("open"))?;
        Self::init(conn, DEFAULT_BUSY_TIMEOUT)
    }

    fn init(conn: Connection, busy_timeout: Duration) -> Result<Self, StorageError> {
        conn.busy_timeout(busy_timeout)
            .map_err(backend("busy_timeout"))?;
        conn.execute_batch(SCHEMA).map_err(backend("schema"))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned {
            table: "sqlite_connection",
        })
    }
}

fn backend(op: &'static str) -> impl Fn(rusqlite::Error) -> StorageError {
    move |err| StorageError::Backend {
        op,
        detail: err.to_string(),
    }
}

fn ms_to_sql(t: UnixTimeMs) -> Result<i64, StorageError> {
    i64::try_from(t.0).map_err(|_| StorageError::Backend {
        op: "encode_time",
        detail: format!("{} exceeds i64", t.0),
    })
}

fn ms_from_sql(v: i64) -> UnixTimeMs {
    UnixTimeMs(u64::try_from(v).unwrap_or(0))
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

impl NonceLedgerRepo for SqliteStore {
    fn claim_nonce(
        &self,
        identifier: &NonceId,
        now: UnixTimeMs,
    ) -> Result<ClaimOutcome, StorageError> {
        identifier.validate()?;
        let used_at = ms_to_sql(now)?;
        let conn = self.conn()?;
        match conn.execute(
            "INSERT INTO cv_used_nonces (nonce, used_at_ms) VALUES (?1, ?2)",
            params![identifier.as_str(), used_at],
        ) {
            Ok(_) => Ok(ClaimOutcome::Claimed),
            Err(err) if is_unique_violation(&err) => Ok(ClaimOutcome::AlreadyClaimed),
            Err(err) => Err(backend("claim_nonce")(err)),
        }
    }

    fn purge_nonces(&self, older_than: UnixTimeMs) -> Result<u64, StorageError> {
        let cutoff = ms_to_sql(older_than)?;
        let conn = self.conn()?;
        let n = conn
            .execute(
                "DELETE FROM cv_used_nonces WHERE used_at_ms < ?1",
                params![cutoff],
            )
            .map_err(backend("purge_nonces"))?;
        Ok(n as u64)
    }

    fn nonce_rows(&self) -> Result<Vec<NonceRecord>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT nonce, used_at_ms FROM cv_used_nonces ORDER BY used_at_ms, nonce")
            .map_err(backend("nonce_rows"))?;
        let raw = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(backend("nonce_rows"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend("nonce_rows"))?;
        raw.into_iter()
            .map(|(nonce, at)| -> Result<NonceRecord, StorageError> {
                Ok(NonceRecord::v1(NonceId::new(nonce)?, ms_from_sql(at)))
            })
            .collect()
    }
}

impl TestSessionRepo for SqliteStore {
    fn insert_test_session(&self, record: TestSessionRecord) -> Result<(), StorageError> {
        record.visitor_address.validate()?;
        record.test_identifier.validate()?;
        let created_at = ms_to_sql(record.created_at)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO cv_sessions (visitor_ip, test_id, test_key, created_at_ms)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.visitor_address.as_str(),
                record.test_identifier.as_str(),
                record.test_key.as_str(),
                created_at,
            ],
        )
        .map_err(backend("insert_test_session"))?;
        Ok(())
    }

    fn latest_test_session(
        &self,
        visitor_address: &VisitorAddress,
        test_identifier: &TestIdentifier,
    ) -> Result<Option<TestSessionRecord>, StorageError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT test_key, created_at_ms FROM cv_sessions
                 WHERE visitor_ip = ?1 AND test_id = ?2
                 ORDER BY id DESC LIMIT 1",
                params![visitor_address.as_str(), test_identifier.as_str()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()
            .map_err(backend("latest_test_session"))?;
        match row {
            None => Ok(None),
            Some((test_key, created_at)) => Ok(Some(TestSessionRecord::v1(
                visitor_address.clone(),
                test_identifier.clone(),
                TestKey::parse(test_key)?,
                ms_from_sql(created_at),
            ))),
        }
    }

    fn purge_test_sessions(&self, older_than: UnixTimeMs) -> Result<u64, StorageError> {
        let cutoff = ms_to_sql(older_than)?;
        let conn = self.conn()?;
        let n = conn
            .execute(
                "DELETE FROM cv_sessions WHERE created_at_ms < ?1",
                params![cutoff],
            )
            .map_err(backend("purge_test_sessions"))?;
        Ok(n as u64)
    }
}

impl TestConfigRepo for SqliteStore {
    fn upsert_test_config(&self, config: TestConfiguration) -> Result<(), StorageError> {
        config.validate()?;
        let json = serde_json::to_string(&config).map_err(|e| StorageError::Backend {
            op: "encode_test_config",
            detail: e.to_string(),
        })?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO cv_test_configs (test_key, config_json) VALUES (?1, ?2)
             ON CONFLICT(test_key) DO UPDATE SET config_json = excluded.config_json",
            params![config.test_key().as_str(), json],
        )
        .map_err(backend("upsert_test_config"))?;
        Ok(())
    }

    fn get_test_config(&self, key: &TestKey) -> Result<Option<TestConfiguration>, StorageError> {
        let conn = self.conn()?;
        let json = conn
            .query_row(
                "SELECT config_json FROM cv_test_configs WHERE test_key = ?1",
                params![key.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(backend("get_test_config"))?;
        json.map(|j| {
            serde_json::from_str::<TestConfiguration>(&j).map_err(|e| StorageError::Backend {
                op: "decode_test_config",
                detail: e.to_string(),
            })
        })
        .transpose()
    }
}

impl AuditLogRepo for SqliteStore {
    fn append_audit_row(&self, input: AuditRowInput) -> Result<u64, StorageError> {
        let at = ms_to_sql(input.at)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO cv_audit_log (at_ms, channel, reason_code, message)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                at,
                input.channel.as_str(),
                i64::from(input.reason_code.0),
                input.message,
            ],
        )
        .map_err(backend("append_audit_row"))?;
        Ok(conn.last_insert_rowid() as u64)
    }

    fn audit_rows(&self) -> Result<Vec<AuditRow>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, at_ms, channel, reason_code, message FROM cv_audit_log ORDER BY id",
            )
            .map_err(backend("audit_rows"))?;
        let raw = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(backend("audit_rows"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend("audit_rows"))?;
        raw.into_iter()
            .map(|(id, at, channel, reason_code, message)| -> Result<AuditRow, StorageError> {
                let channel = AuditChannel::parse(&channel).ok_or(StorageError::Backend {
                    op: "audit_rows",
                    detail: format!("unknown audit channel {channel}"),
                })?;
                Ok(AuditRow {
                    audit_id: id as u64,
                    at: ms_from_sql(at),
                    channel,
                    reason_code: ReasonCodeId(reason_code as u32),
                    message,
                })
            })
            .collect()
    }

    fn purge_audit_rows(&self, older_than: UnixTimeMs) -> Result<u64, StorageError> {
        let cutoff = ms_to_sql(older_than)?;
        let conn = self.conn()?;
        let n = conn
            .execute("DELETE FROM cv_audit_log WHERE at_ms < ?1", params![cutoff])
            .map_err(backend("purge_audit_rows"))?;
        Ok(n as u64)
    }
}
