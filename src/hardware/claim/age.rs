//! Device Age Gate
//!
//! Remembers when each kernel name was first seen by this process and holds
//! devices back until they have been visible for a minimum age, so a disk
//! that is still being set up by someone else is not claimed mid-flight.
//!
//! The record lives in memory only. After a restart every device starts a
//! fresh window, which can delay a claim but never bring one forward.

use crate::domain::ports::ClockRef;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;
use tracing::debug;

/// Default minimum age before a device may be claimed
pub const DEFAULT_DEVICE_MIN_AGE: Duration = Duration::from_secs(60);

/// First-seen record keyed by kernel name
pub struct DeviceAgeTracker {
    first_seen: DashMap<String, DateTime<Utc>>,
    clock: ClockRef,
    min_age: Duration,
}

impl DeviceAgeTracker {
    pub fn new(clock: ClockRef, min_age: Duration) -> Self {
        Self {
            first_seen: DashMap::new(),
            clock,
            min_age,
        }
    }

    pub fn min_age(&self) -> Duration {
        self.min_age
    }

    /// Record `kname` if it has not been seen before; returns the first-seen time
    pub fn record(&self, kname: &str) -> DateTime<Utc> {
        *self
            .first_seen
            .entry(kname.to_string())
            .or_insert_with(|| {
                let now = self.clock.now();
                debug!(kname, first_seen = %now, "Recording new device");
                now
            })
    }

    pub fn first_seen(&self, kname: &str) -> Option<DateTime<Utc>> {
        self.first_seen.get(kname).map(|entry| *entry)
    }

    /// Whether `kname` was first seen at least `min_age` ago.
    ///
    /// Unknown names are not old enough. A clock that went backwards counts
    /// as no time elapsed.
    pub fn is_older_than_min_age(&self, kname: &str) -> bool {
        let Some(first_seen) = self.first_seen(kname) else {
            return false;
        };
        match (self.clock.now() - first_seen).to_std() {
            Ok(elapsed) => elapsed >= self.min_age,
            Err(_) => false,
        }
    }

    /// Requeue delay to use while devices are waiting out their age
    pub fn fast_requeue(&self) -> Duration {
        self.min_age / 2
    }

    pub fn len(&self) -> usize {
        self.first_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.first_seen.is_empty()
    }
}

impl std::fmt::Debug for DeviceAgeTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceAgeTracker")
            .field("devices", &self.first_seen.len())
            .field("min_age", &self.min_age)
            .finish()
    }
}
