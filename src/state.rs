/// Lock-guarded record of the most recent successful and failed probe.
///
/// Every accessor takes the lock for exactly one read or write, so readers
/// never see a torn update and the guard is never held across I/O or hook calls.
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Sentinel stored before the first success/failure is observed.
pub const NEVER: DateTime<Utc> = DateTime::<Utc>::UNIX_EPOCH;

/// Returns `true` if `ts` is the "never happened" sentinel.
pub fn is_never(ts: &DateTime<Utc>) -> bool {
    *ts == NEVER
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Timestamps {
    last_success: DateTime<Utc>,
    last_failure: DateTime<Utc>,
}

/// Last-success / last-failure timestamps shared between the monitor task
/// and its readers.
#[derive(Debug)]
pub struct ProbeState {
    inner: Mutex<Timestamps>,
}

impl ProbeState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Timestamps {
                last_success: NEVER,
                last_failure: NEVER,
            }),
        }
    }

    // The guarded data is two plain timestamps, so a panic while holding the
    // lock cannot leave it half-written.
    fn lock(&self) -> MutexGuard<'_, Timestamps> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn last_success(&self) -> DateTime<Utc> {
        self.lock().last_success
    }

    pub fn last_failure(&self) -> DateTime<Utc> {
        self.lock().last_failure
    }

    pub fn set_last_success(&self, now: DateTime<Utc>) {
        self.lock().last_success = now;
    }

    pub fn set_last_failure(&self, now: DateTime<Utc>) {
        self.lock().last_failure = now;
    }

    /// Both timestamps, read under a single acquisition.
    pub fn snapshot(&self) -> ProbeSnapshot {
        let guard = self.lock();
        ProbeSnapshot {
            last_success: guard.last_success,
            last_failure: guard.last_failure,
        }
    }
}

impl Default for ProbeState {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view of a monitor's [`ProbeState`].
///
/// Cheap to clone; hand it to hooks, sinks or the HTTP endpoint. It exposes
/// no setters, so the monitor task stays the only writer.
#[derive(Debug, Clone)]
pub struct ProbeReader {
    state: Arc<ProbeState>,
}

impl ProbeReader {
    pub(crate) fn new(state: Arc<ProbeState>) -> Self {
        Self { state }
    }

    pub fn last_success(&self) -> DateTime<Utc> {
        self.state.last_success()
    }

    pub fn last_failure(&self) -> DateTime<Utc> {
        self.state.last_failure()
    }

    pub fn snapshot(&self) -> ProbeSnapshot {
        self.state.snapshot()
    }
}

/// Point-in-time copy of both timestamps.
///
/// Serializes the [`NEVER`] sentinel as `null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProbeSnapshot {
    #[serde(serialize_with = "serialize_sentinel")]
    pub last_success: DateTime<Utc>,
    #[serde(serialize_with = "serialize_sentinel")]
    pub last_failure: DateTime<Utc>,
}

impl ProbeSnapshot {
    /// Last success, or `None` if the host never answered.
    pub fn success(&self) -> Option<DateTime<Utc>> {
        (!is_never(&self.last_success)).then_some(self.last_success)
    }

    /// Last failure, or `None` if no probe ever failed.
    pub fn failure(&self) -> Option<DateTime<Utc>> {
        (!is_never(&self.last_failure)).then_some(self.last_failure)
    }
}

fn serialize_sentinel<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    if is_never(ts) {
        serializer.serialize_none()
    } else {
        ts.serialize(serializer)
    }
}
