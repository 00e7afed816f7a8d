//! Hybrid logical clock.
//!
//! A [`HlcTimestamp`] combines wall-clock milliseconds with a logical counter
//! and the issuing node id. Timestamps are totally ordered by
//! `(physical_time, logical_counter, node_id)`.
//!
//! A [`HlcClock`] hands out strictly increasing timestamps for one node, even
//! when the wall clock stalls or jumps backwards.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// An immutable hybrid logical clock timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HlcTimestamp {
    /// Wall-clock component in milliseconds since the Unix epoch.
    pub physical_time: i64,
    /// Logical counter disambiguating ticks within one millisecond.
    pub logical_counter: i32,
    /// Id of the node that issued the timestamp.
    pub node_id: String,
}

impl HlcTimestamp {
    /// Creates a timestamp from its parts.
    pub fn new(physical_time: i64, logical_counter: i32, node_id: impl Into<String>) -> Self {
        Self {
            physical_time,
            logical_counter,
            node_id: node_id.into(),
        }
    }

    /// The smallest timestamp, reported by an empty oplog.
    pub fn zero() -> Self {
        Self::new(0, 0, "")
    }

    /// Returns true if this is the empty-log timestamp.
    pub fn is_zero(&self) -> bool {
        self.physical_time == 0 && self.logical_counter == 0 && self.node_id.is_empty()
    }
}

impl Ord for HlcTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.physical_time
            .cmp(&other.physical_time)
            .then(self.logical_counter.cmp(&other.logical_counter))
            .then_with(|| self.node_id.cmp(&other.node_id))
    }
}

impl PartialOrd for HlcTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for HlcTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.physical_time, self.logical_counter, self.node_id
        )
    }
}

/// Current wall time in milliseconds since the Unix epoch.
pub fn wall_clock_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Clock issuing timestamps for a single node.
///
/// The last issued timestamp is the only mutable state and every access goes
/// through one mutex, so concurrent ticks on the same node never collide.
#[derive(Debug)]
pub struct HlcClock {
    node_id: String,
    last: Mutex<HlcTimestamp>,
}

impl HlcClock {
    /// Creates a clock seeded from the latest persisted timestamp.
    ///
    /// `latest` is the maximum timestamp in the local oplog. When the log is
    /// empty the clock starts at the current wall time with counter 0.
    pub fn seeded(node_id: impl Into<String>, latest: &HlcTimestamp) -> Self {
        let node_id = node_id.into();
        let initial = if latest.physical_time > 0 {
            latest.clone()
        } else {
            HlcTimestamp::new(wall_clock_millis(), 0, node_id.clone())
        };
        Self {
            node_id,
            last: Mutex::new(initial),
        }
    }

    /// Returns the id of the node owning this clock.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Issues the next timestamp using the system wall clock.
    pub fn tick(&self) -> HlcTimestamp {
        self.tick_at(wall_clock_millis())
    }

    /// Issues the next timestamp given the current wall time `now`.
    pub fn tick_at(&self, now: i64) -> HlcTimestamp {
        let mut last = self.last.lock();
        let next = if now > last.physical_time {
            HlcTimestamp::new(now, 0, self.node_id.clone())
        } else {
            match last.logical_counter.checked_add(1) {
                Some(counter) => {
                    HlcTimestamp::new(last.physical_time, counter, self.node_id.clone())
                }
                // Counter exhausted: borrow the next millisecond.
                None => HlcTimestamp::new(
                    last.physical_time.saturating_add(1),
                    0,
                    self.node_id.clone(),
                ),
            }
        };
        *last = next.clone();
        next
    }

    /// Folds a timestamp received from another node into the clock state.
    ///
    /// Subsequent ticks are strictly greater than `remote`.
    pub fn observe(&self, remote: &HlcTimestamp) {
        let mut last = self.last.lock();
        if *remote > *last {
            *last = remote.clone();
        }
    }

    /// Returns the last issued or observed timestamp.
    pub fn current(&self) -> HlcTimestamp {
        self.last.lock().clone()
    }
}
