//! Wall-clock source, swappable in tests.

use chrono::{DateTime, Utc};

#[cfg(test)]
use mockall::automock;

/// Source of "now" for queue timestamps.
#[cfg_attr(test, automock)]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
