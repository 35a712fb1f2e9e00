#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use checkview_contracts::nonce::nonce_purge_cutoff;
use checkview_contracts::session::DEFAULT_SESSION_TTL_MS;
use checkview_contracts::{ReasonCodeId, UnixTimeMs};
use checkview_storage::audit::{audit_purge_cutoff, AuditChannel, AuditRowInput, AuditRuntime};
use checkview_storage::repo::CheckviewStore;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::clock::Clock;

pub mod reason_codes {
    use checkview_contracts::ReasonCodeId;

    pub const CLEANUP_OK_NONCES_PURGED: ReasonCodeId = ReasonCodeId(0xC720_0001);
    pub const CLEANUP_OK_SESSIONS_PURGED: ReasonCodeId = ReasonCodeId(0xC720_0002);
    pub const CLEANUP_OK_AUDIT_PURGED: ReasonCodeId = ReasonCodeId(0xC720_0003);
    pub const CLEANUP_FAIL_NONCE_PURGE: ReasonCodeId = ReasonCodeId(0xC720_00F1);
    pub const CLEANUP_FAIL_SESSION_PURGE: ReasonCodeId = ReasonCodeId(0xC720_00F2);
    pub const CLEANUP_FAIL_AUDIT_PURGE: ReasonCodeId = ReasonCodeId(0xC720_00F3);
}

pub const NONCE_CLEANUP_JOB: &str = "checkview_nonce_cleanup_cron";
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// What one cycle removed. `None` means that purge failed and was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CleanupCycleReport {
    pub nonces_purged: Option<u64>,
    pub sessions_purged: Option<u64>,
    pub audit_rows_purged: Option<u64>,
}

/// A recurring maintenance job. Implementations must not panic on store failure.
pub trait CleanupJob: Send + Sync + 'static {
    fn run_cycle(&self, now: UnixTimeMs) -> CleanupCycleReport;
}

/// Drops nonces past the retention window, sessions past their TTL and audit rows past
/// the audit retention window.
pub struct RetentionCleanup {
    store: Arc<dyn CheckviewStore>,
    session_ttl_ms: u64,
}

impl RetentionCleanup {
    pub fn new(store: Arc<dyn CheckviewStore>) -> Self {
        Self {
            store,
            session_ttl_ms: DEFAULT_SESSION_TTL_MS,
        }
    }

    pub fn with_session_ttl_ms(mut self, session_ttl_ms: u64) -> Self {
        self.session_ttl_ms = session_ttl_ms;
        self
    }

    fn audit(&self, at: UnixTimeMs, code: ReasonCodeId, message: String) {
        let row = AuditRowInput::v1(at, AuditChannel::Cleanup, code, message);
        if let Err(err) = AuditRuntime::emit(&*self.store, row) {
            warn!(error = %err, "cleanup audit write failed");
        }
    }
}

impl CleanupJob for RetentionCleanup {
    fn run_cycle(&self, now: UnixTimeMs) -> CleanupCycleReport {
        let mut report = CleanupCycleReport::default();

        let cutoff = nonce_purge_cutoff(now);
        match self.store.purge_nonces(cutoff) {
            Ok(removed) => {
                info!(removed, cutoff_ms = cutoff.0, "used nonces purged");
                report.nonces_purged = Some(removed);
                self.audit(
                    now,
                    reason_codes::CLEANUP_OK_NONCES_PURGED,
                    format!("Purged {removed} used nonces."),
                );
            }
            Err(err) => {
                error!(error = %err, "nonce purge failed");
                self.audit(
                    now,
                    reason_codes::CLEANUP_FAIL_NONCE_PURGE,
                    format!("Nonce purge failed: {err}"),
                );
            }
        }

        // Runs even when the nonce purge failed; the two tables are independent.
        let cutoff = now.saturating_sub_ms(self.session_ttl_ms);
        match self.store.purge_test_sessions(cutoff) {
            Ok(removed) => {
                info!(removed, cutoff_ms = cutoff.0, "expired test sessions purged");
                report.sessions_purged = Some(removed);
                self.audit(
                    now,
                    reason_codes::CLEANUP_OK_SESSIONS_PURGED,
                    format!("Purged {removed} expired test sessions."),
                );
            }
            Err(err) => {
                error!(error = %err, "test session purge failed");
                self.audit(
                    now,
                    reason_codes::CLEANUP_FAIL_SESSION_PURGE,
                    format!("Test session purge failed: {err}"),
                );
            }
        }

        // Last, so the rows written above are never candidates.
        let cutoff = audit_purge_cutoff(now);
        match self.store.purge_audit_rows(cutoff) {
            Ok(removed) => {
                info!(removed, cutoff_ms = cutoff.0, "old audit rows purged");
                report.audit_rows_purged = Some(removed);
                self.audit(
                    now,
                    reason_codes::CLEANUP_OK_AUDIT_PURGED,
                    format!("Purged {removed} audit rows."),
                );
            }
            Err(err) => {
                error!(error = %err, "audit purge failed");
                self.audit(
                    now,
                    reason_codes::CLEANUP_FAIL_AUDIT_PURGE,
                    format!("Audit purge failed: {err}"),
                );
            }
        }

        report
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Scheduled,
    AlreadyScheduled,
}

/// Named recurring jobs, at most one live task per name.
#[derive(Default)]
pub struct CleanupScheduler {
    jobs: Mutex<BTreeMap<&'static str, JoinHandle<()>>>,
}

impl CleanupScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> MutexGuard<'_, BTreeMap<&'static str, JoinHandle<()>>> {
        // The map only holds handles; a panic elsewhere cannot leave it half-written.
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts `job` every `every`, first run immediately. Must be called inside a tokio runtime.
    pub fn schedule_recurring(
        &self,
        name: &'static str,
        every: Duration,
        job: Arc<dyn CleanupJob>,
        clock: Arc<dyn Clock>,
    ) -> ScheduleOutcome {
        let mut jobs = self.jobs();
        if jobs.get(name).is_some_and(|h| !h.is_finished()) {
            return ScheduleOutcome::AlreadyScheduled;
        }

        let handle = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let job = job.clone();
                let now = clock.now();
                // Store calls block; keep them off the async workers.
                let run = tokio::task::spawn_blocking(move || job.run_cycle(now)).await;
                if let Err(err) = run {
                    error!(job = name, error = %err, "cleanup cycle aborted");
                }
            }
        });
        jobs.insert(name, handle);
        info!(job = name, every_ms = every.as_millis() as u64, "cleanup job scheduled");
        ScheduleOutcome::Scheduled
    }

    pub fn is_scheduled(&self, name: &str) -> bool {
        self.jobs().get(name).is_some_and(|h| !h.is_finished())
    }

    pub fn shutdown(&self) {
        for (name, handle) in std::mem::take(&mut *self.jobs()) {
            handle.abort();
            info!(job = name, "cleanup job stopped");
        }
    }
}

impl Drop for CleanupScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
