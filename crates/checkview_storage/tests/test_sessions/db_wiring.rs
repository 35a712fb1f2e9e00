#![forbid(unsafe_code)]

use std::sync::Arc;

use checkview_contracts::identifier::TestIdentifier;
use checkview_contracts::session::{TestConfiguration, TestKey, TestSessionRecord, VisitorAddress};
use checkview_contracts::UnixTimeMs;
use checkview_storage::repo::CheckviewStore;
use checkview_storage::sqlite::SqliteStore;
use checkview_storage::InMemoryStore;

fn visitor(addr: &str) -> VisitorAddress {
    VisitorAddress::new(addr).unwrap()
}

fn test_id(n: u8) -> TestIdentifier {
    TestIdentifier::new(format!("{n:02x}222222-2222-2222-2222-222222222222")).unwrap()
}

fn backends() -> Vec<(&'static str, Arc<dyn CheckviewStore>)> {
    vec![
        ("memory", Arc::new(InMemoryStore::new_in_memory())),
        ("sqlite", Arc::new(SqliteStore::open_in_memory().unwrap())),
    ]
}

#[test]
fn at_sessions_db_01_latest_row_wins_for_the_pair() {
    for (name, s) in backends() {
        s.insert_test_session(TestSessionRecord::v1(
            visitor("203.0.113.5"),
            test_id(1),
            TestKey::for_page(10),
            UnixTimeMs(100),
        ))
        .unwrap();
        s.insert_test_session(TestSessionRecord::v1(
            visitor("203.0.113.5"),
            test_id(1),
            TestKey::for_page(11),
            UnixTimeMs(200),
        ))
        .unwrap();

        let got = s
            .latest_test_session(&visitor("203.0.113.5"), &test_id(1))
            .unwrap()
            .unwrap();
        assert_eq!(got.test_key, TestKey::for_page(11), "{name}");
        assert_eq!(got.created_at, UnixTimeMs(200), "{name}");
    }
}

#[test]
fn at_sessions_db_02_other_visitor_or_test_finds_nothing() {
    for (name, s) in backends() {
        s.insert_test_session(TestSessionRecord::v1(
            visitor("203.0.113.5"),
            test_id(1),
            TestKey::for_page(10),
            UnixTimeMs(100),
        ))
        .unwrap();
        assert_eq!(
            s.latest_test_session(&visitor("203.0.113.6"), &test_id(1))
                .unwrap(),
            None,
            "{name}"
        );
        assert_eq!(
            s.latest_test_session(&visitor("203.0.113.5"), &test_id(2))
                .unwrap(),
            None,
            "{name}"
        );
    }
}

#[test]
fn at_sessions_db_03_purge_drops_only_old_sessions() {
    for (name, s) in backends() {
        s.insert_test_session(TestSessionRecord::v1(
            visitor("198.51.100.1"),
            test_id(3),
            TestKey::for_page(1),
            UnixTimeMs(100),
        ))
        .unwrap();
        s.insert_test_session(TestSessionRecord::v1(
            visitor("198.51.100.2"),
            test_id(3),
            TestKey::for_page(1),
            UnixTimeMs(300),
        ))
        .unwrap();
        assert_eq!(s.purge_test_sessions(UnixTimeMs(200)).unwrap(), 1, "{name}");
        assert!(s
            .latest_test_session(&visitor("198.51.100.1"), &test_id(3))
            .unwrap()
            .is_none());
        assert!(s
            .latest_test_session(&visitor("198.51.100.2"), &test_id(3))
            .unwrap()
            .is_some());
    }
}

#[test]
fn at_sessions_db_04_test_config_is_last_write_wins() {
    for (name, s) in backends() {
        s.upsert_test_config(TestConfiguration::v1(5, 42, "contact", "a@example.com").unwrap())
            .unwrap();
        s.upsert_test_config(TestConfiguration::v1(6, 42, "checkout", "b@example.com").unwrap())
            .unwrap();
        let got = s.get_test_config(&TestKey::for_page(42)).unwrap().unwrap();
        assert_eq!(got.form_id, 6, "{name}");
        assert_eq!(got.test_type, "checkout", "{name}");
        assert_eq!(got.send_to, "b@example.com", "{name}");
        assert_eq!(s.get_test_config(&TestKey::for_page(43)).unwrap(), None, "{name}");
    }
}
