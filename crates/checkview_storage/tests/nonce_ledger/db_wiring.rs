#![forbid(unsafe_code)]

use std::sync::{Arc, Barrier};
use std::thread;

use checkview_contracts::identifier::NonceId;
use checkview_contracts::nonce::{nonce_purge_cutoff, ClaimOutcome, NONCE_RETENTION_MS};
use checkview_contracts::UnixTimeMs;
use checkview_storage::repo::NonceLedgerRepo;
use checkview_storage::sqlite::SqliteStore;
use checkview_storage::InMemoryStore;

fn nonce(n: u32) -> NonceId {
    NonceId::new(format!("{n:08x}-0000-4000-8000-000000000000")).unwrap()
}

fn backends() -> Vec<(&'static str, Arc<dyn NonceLedgerRepo>)> {
    vec![
        ("memory", Arc::new(InMemoryStore::new_in_memory())),
        ("sqlite", Arc::new(SqliteStore::open_in_memory().unwrap())),
    ]
}

#[test]
fn at_ledger_db_01_claim_twice_yields_one_claimed_one_already_claimed() {
    for (name, s) in backends() {
        let first = s.claim_nonce(&nonce(1), UnixTimeMs(1_000)).unwrap();
        let second = s.claim_nonce(&nonce(1), UnixTimeMs(1_001)).unwrap();
        assert_eq!(first, ClaimOutcome::Claimed, "{name}");
        assert_eq!(second, ClaimOutcome::AlreadyClaimed, "{name}");
        assert_eq!(s.nonce_rows().unwrap().len(), 1, "{name}");
    }
}

#[test]
fn at_ledger_db_02_concurrent_claims_admit_exactly_one() {
    const RACERS: usize = 8;
    for (name, s) in backends() {
        let barrier = Arc::new(Barrier::new(RACERS));
        let handles: Vec<_> = (0..RACERS)
            .map(|i| {
                let s = Arc::clone(&s);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    s.claim_nonce(&nonce(7), UnixTimeMs(5_000 + i as u64))
                        .unwrap()
                })
            })
            .collect();
        let outcomes: Vec<ClaimOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let claimed = outcomes
            .iter()
            .filter(|o| **o == ClaimOutcome::Claimed)
            .count();
        assert_eq!(claimed, 1, "{name}");
        assert_eq!(s.nonce_rows().unwrap().len(), 1, "{name}");
    }
}

#[test]
fn at_ledger_db_03_purge_boundary_is_twenty_four_hours() {
    let t = UnixTimeMs(1_700_000_000_000);
    let eps = 1;
    for (name, s) in backends() {
        s.claim_nonce(&nonce(3), t).unwrap();

        let just_before = t.saturating_add_ms(NONCE_RETENTION_MS - eps);
        assert_eq!(s.purge_nonces(nonce_purge_cutoff(just_before)).unwrap(), 0, "{name}");
        assert_eq!(s.nonce_rows().unwrap().len(), 1, "{name}");

        let just_after = t.saturating_add_ms(NONCE_RETENTION_MS + eps);
        assert_eq!(s.purge_nonces(nonce_purge_cutoff(just_after)).unwrap(), 1, "{name}");
        assert!(s.nonce_rows().unwrap().is_empty(), "{name}");
    }
}

#[test]
fn at_ledger_db_04_purge_is_idempotent_and_keeps_fresh_rows() {
    for (name, s) in backends() {
        s.claim_nonce(&nonce(10), UnixTimeMs(100)).unwrap();
        s.claim_nonce(&nonce(11), UnixTimeMs(900)).unwrap();
        assert_eq!(s.purge_nonces(UnixTimeMs(500)).unwrap(), 1, "{name}");
        assert_eq!(s.purge_nonces(UnixTimeMs(500)).unwrap(), 0, "{name}");
        let rows = s.nonce_rows().unwrap();
        assert_eq!(rows.len(), 1, "{name}");
        assert_eq!(rows[0].identifier, nonce(11), "{name}");
    }
}

#[test]
fn at_ledger_db_05_purged_identifier_can_be_claimed_again() {
    // retention-bounded approximation: replay protection ends with the record
    for (name, s) in backends() {
        s.claim_nonce(&nonce(12), UnixTimeMs(100)).unwrap();
        s.purge_nonces(UnixTimeMs(101)).unwrap();
        assert_eq!(
            s.claim_nonce(&nonce(12), UnixTimeMs(200)).unwrap(),
            ClaimOutcome::Claimed,
            "{name}"
        );
    }
}
