//! Time sources and the data horizon.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use orb_schema::LAST_MODIFIED_COLUMN;
use orb_sql::Filter;

/// Supplies the current time for last-modified stamps and horizon cutoffs.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().expect("clock lock poisoned") = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock lock poisoned");
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock poisoned")
    }
}

/// Objects not modified within `window` of now are left out of initial
/// loads of horizon-controlled classes.
///
/// The horizon only narrows the first select of a load. Objects reached
/// through references are always loaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataHorizon {
    window: Duration,
}

impl DataHorizon {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Oldest last-modified time still inside the horizon.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.window
    }

    pub fn filter(&self, now: DateTime<Utc>) -> Filter {
        Filter::ge(LAST_MODIFIED_COLUMN, self.cutoff(now))
    }
}
