#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use checkview_contracts::UnixTimeMs;

pub trait Clock: Send + Sync {
    fn now(&self) -> UnixTimeMs;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixTimeMs {
        // A clock before 1970 reads as the epoch; retention math saturates from there.
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        UnixTimeMs(ms)
    }
}
