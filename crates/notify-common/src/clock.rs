//! Clock abstraction so scheduling, backoff, and rate-limit window logic can
//! be driven deterministically in tests instead of racing real wall time.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::sync::Arc;

pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Shared via `Arc` so a test can hold
/// one handle, hand clones to every component under test, and advance all of
/// them together with a single call.
#[derive(Debug, Clone)]
pub struct TestClock {
    current: Arc<RwLock<DateTime<Utc>>>,
}

impl TestClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { current: Arc::new(RwLock::new(start)) }
    }

    pub fn at_epoch() -> Self {
        Self::new(DateTime::from_timestamp(0, 0).expect("epoch is representable"))
    }

    pub fn advance(&self, duration: Duration) {
        let mut guard = self.current.write();
        *guard += duration;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.current.write() = at;
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.read()
    }
}
