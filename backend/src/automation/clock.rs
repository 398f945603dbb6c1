use chrono::{DateTime, Utc};

/// Wall-clock source. Trigger due times and eligibility windows are always
/// computed from this, never from elapsed in-process counters.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
