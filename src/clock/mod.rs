//! Synchronizes time across components

use std::ops::Deref;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use time::{format_description, Date, OffsetDateTime};

pub const NANOS_IN_SEC: i64 = 1_000_000_000;

///[DateTime] is a wrapper around epoch time in nanoseconds as i64. Data carries two of these:
///`ts_event` is the origin-exchange timestamp, `ts_init` is the local-receipt timestamp. All
///ordering within a backtest runs off `ts_init`.
//The internal representation with the time package should remain hidden from clients. Whilst this
//results in some duplication of the API, this retains the option to get rid of the dependency on
//time or change individual functions later.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct DateTime(i64);

impl DateTime {
    pub fn from_date_string(val: &str, date_fmt: &str) -> Self {
        let format = format_description::parse(date_fmt).unwrap();
        let parsed_date = Date::parse(val, &format).unwrap();
        let parsed_time = parsed_date.with_time(time::macros::time!(09:00));
        Self::from(parsed_time.assume_utc().unix_timestamp() * NANOS_IN_SEC)
    }

    pub fn from_secs(val: i64) -> Self {
        Self(val * NANOS_IN_SEC)
    }
}

impl Deref for DateTime {
    type Target = i64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<DateTime> for i64 {
    fn from(v: DateTime) -> Self {
        v.0
    }
}

impl From<i64> for DateTime {
    fn from(v: i64) -> Self {
        DateTime(v)
    }
}

///A named one-shot timer. Fired at most once when the owning clock passes `ts`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Alert {
    pub name: String,
    pub ts: DateTime,
}

#[doc(hidden)]
#[derive(Debug)]
pub struct TestClockInner {
    now: DateTime,
    alerts: Vec<Alert>,
}

/// Deterministic clock used to synchronize time between components in a backtest.
///
/// Time only moves when the owning orchestrator calls `advance_to`, no component other than the
/// orchestrator may advance or set it. [TestClock] is thread-safe and wrapped in [Arc] so can be
/// cheaply cloned and references held across the application.
#[derive(Debug)]
pub struct TestClock {
    inner: Arc<Mutex<TestClockInner>>,
}

impl Clone for TestClock {
    fn clone(&self) -> Self {
        TestClock {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl TestClock {
    pub fn new(start: impl Into<DateTime>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TestClockInner {
                now: start.into(),
                alerts: Vec::new(),
            })),
        }
    }

    pub fn now(&self) -> DateTime {
        let inner = self.inner.lock().unwrap();
        inner.now
    }

    pub fn set_alert(&self, name: impl Into<String>, ts: impl Into<DateTime>) {
        let mut inner = self.inner.lock().unwrap();
        inner.alerts.push(Alert {
            name: name.into(),
            ts: ts.into(),
        });
    }

    pub fn cancel_alert(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.alerts.retain(|alert| alert.name != name);
    }

    /// Moves time forward to `ts` and returns the alerts that came due, ordered by timestamp
    /// with insertion order breaking ties. Time never moves backwards: an earlier `ts` leaves
    /// the clock where it is.
    pub fn advance_to(&self, ts: impl Into<DateTime>) -> Vec<Alert> {
        let ts = ts.into();
        let mut inner = self.inner.lock().unwrap();
        if ts < inner.now {
            return Vec::new();
        }
        inner.now = ts;

        let mut due: Vec<Alert> = Vec::new();
        let mut remaining: Vec<Alert> = Vec::new();
        for alert in inner.alerts.drain(..) {
            if alert.ts <= ts {
                due.push(alert);
            } else {
                remaining.push(alert);
            }
        }
        inner.alerts = remaining;
        //Stable sort so same-timestamp alerts fire in the order they were set
        due.sort_by_key(|alert| alert.ts);
        due
    }
}

/// Wall-clock driven equivalent of [TestClock] for live use. Carries the same alert API so
/// components written against [Clock] do not care which implementation is behind it, but time
/// cannot be advanced manually.
#[derive(Clone, Debug)]
pub struct LiveClock {
    alerts: Arc<Mutex<Vec<Alert>>>,
}

impl LiveClock {
    pub fn new() -> Self {
        Self {
            alerts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn now(&self) -> DateTime {
        DateTime::from(OffsetDateTime::now_utc().unix_timestamp_nanos() as i64)
    }

    pub fn set_alert(&self, name: impl Into<String>, ts: impl Into<DateTime>) {
        let mut alerts = self.alerts.lock().unwrap();
        alerts.push(Alert {
            name: name.into(),
            ts: ts.into(),
        });
    }

    pub fn take_due_alerts(&self) -> Vec<Alert> {
        let now = self.now();
        let mut alerts = self.alerts.lock().unwrap();
        let mut due: Vec<Alert> = Vec::new();
        let mut remaining: Vec<Alert> = Vec::new();
        for alert in alerts.drain(..) {
            if alert.ts <= now {
                due.push(alert);
            } else {
                remaining.push(alert);
            }
        }
        *alerts = remaining;
        due.sort_by_key(|alert| alert.ts);
        due
    }
}

impl Default for LiveClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Time source injected into every component at construction.
#[derive(Clone, Debug)]
pub enum Clock {
    Test(TestClock),
    Live(LiveClock),
}

impl Clock {
    pub fn now(&self) -> DateTime {
        match self {
            Clock::Test(clock) => clock.now(),
            Clock::Live(clock) => clock.now(),
        }
    }

    pub fn set_alert(&self, name: impl Into<String>, ts: impl Into<DateTime>) {
        match self {
            Clock::Test(clock) => clock.set_alert(name, ts),
            Clock::Live(clock) => clock.set_alert(name, ts),
        }
    }
}

impl From<TestClock> for Clock {
    fn from(v: TestClock) -> Self {
        Clock::Test(v)
    }
}
