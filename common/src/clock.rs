use std::time::Duration;

use chrono::{DateTime, Utc};

/// 2021-01-01T00:00:00Z. Anything earlier means SNTP has not run yet.
pub const MIN_VALID_EPOCH: i64 = 1_609_459_200;

pub trait Clock {
    fn now_utc(&self) -> DateTime<Utc>;
    /// Monotonic time since boot. Unaffected by SNTP corrections.
    fn uptime(&self) -> Duration;
}

pub fn is_time_set(now: DateTime<Utc>) -> bool {
    now.timestamp() >= MIN_VALID_EPOCH
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedClock {
    now: DateTime<Utc>,
    uptime: Duration,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            uptime: Duration::ZERO,
        }
    }

    pub fn advance(&mut self, seconds: u32) {
        self.now += chrono::Duration::seconds(i64::from(seconds));
        self.uptime += Duration::from_secs(u64::from(seconds));
    }
}

impl Clock for FixedClock {
    fn now_utc(&self) -> DateTime<Utc> {
        self.now
    }

    fn uptime(&self) -> Duration {
        self.uptime
    }
}
