//! Wall-clock seconds source with backward-step mitigation
//!
//! Ingest bookkeeping and the reaper both work in unix seconds. A raw
//! `Utc::now()` can step backward under NTP adjustment, which would let the
//! reaper compute a cutoff earlier than one it already acted on.

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

/// A clock source whose second-resolution timestamps never go backward.
#[derive(Debug, Default)]
pub struct WallClock {
    /// High-water mark: the largest timestamp we've ever returned (seconds)
    high_water: AtomicI64,
}

impl WallClock {
    pub fn new() -> Self {
        Self {
            high_water: AtomicI64::new(0),
        }
    }

    /// Returns the current unix time in seconds, never less than any
    /// previously returned value.
    pub fn now_secs(&self) -> u32 {
        let wall = Utc::now().timestamp();
        loop {
            let prev = self.high_water.load(Ordering::Acquire);
            let ts = wall.max(prev);
            match self.high_water.compare_exchange_weak(
                prev,
                ts,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return ts.max(0) as u32,
                Err(_) => continue,
            }
        }
    }
}
