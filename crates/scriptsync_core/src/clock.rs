//! Monotonic local clock used to order cache writes against queued patches.

use std::sync::atomic::{AtomicU64, Ordering};

/// A point on the local clock, in milliseconds since the Unix epoch.
///
/// Stamps handed out by one [`LocalClock`] are strictly increasing, so two
/// stamps compare equal only when they came from the same call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Stamp(u64);

impl Stamp {
    /// Wrap a raw millisecond value.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Raw millisecond value.
    pub const fn as_millis(self) -> u64 {
        self.0
    }
}

/// Wall-clock backed stamp source that never repeats or goes backwards.
#[derive(Debug, Default)]
pub struct LocalClock {
    last: AtomicU64,
}

impl LocalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a stamp strictly greater than every stamp returned before.
    ///
    /// Uses wall-clock milliseconds when they move forward and falls back to
    /// `last + 1` when several stamps are taken within one millisecond or the
    /// system clock steps backwards.
    pub fn now(&self) -> Stamp {
        let wall = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let next = wall.max(last.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return Stamp(next),
                Err(observed) => last = observed,
            }
        }
    }
}
