#![forbid(unsafe_code)]

use std::sync::Arc;

use checkview_contracts::gate::reason_codes;
use checkview_contracts::{ReasonCodeId, UnixTimeMs};
use checkview_storage::audit::{AuditChannel, AuditRowInput, AuditRuntime};
use checkview_storage::repo::AuditLogRepo;
use checkview_storage::sqlite::SqliteStore;
use checkview_storage::InMemoryStore;

fn backends() -> Vec<(&'static str, Arc<dyn AuditLogRepo>)> {
    vec![
        ("memory", Arc::new(InMemoryStore::new_in_memory())),
        ("sqlite", Arc::new(SqliteStore::open_in_memory().unwrap())),
    ]
}

#[test]
fn at_audit_db_01_rows_are_append_only_and_ordered() {
    for (name, s) in backends() {
        let a = AuditRuntime::emit(
            &*s,
            AuditRowInput::v1(
                UnixTimeMs(10),
                AuditChannel::ApiLogs,
                reason_codes::GATE_DENY_AUTH_MISSING,
                "Empty Auth header.",
            ),
        )
        .unwrap();
        let b = AuditRuntime::emit(
            &*s,
            AuditRowInput::v1(
                UnixTimeMs(11),
                AuditChannel::Cleanup,
                ReasonCodeId(0xC710_0001),
                "  purged 3 nonces  ",
            ),
        )
        .unwrap();
        assert!(b > a, "{name}");

        let rows = s.audit_rows().unwrap();
        assert_eq!(rows.len(), 2, "{name}");
        assert_eq!(rows[0].channel, AuditChannel::ApiLogs, "{name}");
        assert_eq!(rows[0].reason_code, reason_codes::GATE_DENY_AUTH_MISSING, "{name}");
        assert_eq!(rows[1].message, "purged 3 nonces", "{name}");
        assert_eq!(rows[1].at, UnixTimeMs(11), "{name}");
    }
}

#[test]
fn at_audit_db_02_purge_drops_only_rows_before_cutoff_and_keeps_ids_rising() {
    for (name, s) in backends() {
        for at in [100, 199, 200, 300] {
            s.append_audit_row(AuditRowInput::v1(
                UnixTimeMs(at),
                AuditChannel::ApiLogs,
                reason_codes::GATE_DENY_AUTH_MISSING,
                "Empty Auth header.",
            ))
            .unwrap();
        }
        assert_eq!(s.purge_audit_rows(UnixTimeMs(200)).unwrap(), 2, "{name}");
        let left: Vec<_> = s.audit_rows().unwrap().into_iter().map(|r| r.at).collect();
        assert_eq!(left, vec![UnixTimeMs(200), UnixTimeMs(300)], "{name}");
        assert_eq!(s.purge_audit_rows(UnixTimeMs(200)).unwrap(), 0, "{name}");

        let next = s
            .append_audit_row(AuditRowInput::v1(
                UnixTimeMs(400),
                AuditChannel::Cleanup,
                ReasonCodeId(0xC720_0001),
                "Purged 0 used nonces.",
            ))
            .unwrap();
        assert!(next > 4, "{name}");
        let ids: Vec<_> = s.audit_rows().unwrap().into_iter().map(|r| r.audit_id).collect();
        assert_eq!(ids.len(), 3, "{name}");
        assert_eq!(ids.last(), Some(&next), "{name}");
    }
}
