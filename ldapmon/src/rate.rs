//! Counter to rate conversion
//!
//! Directory servers expose cumulative counters. Operators mostly want to know
//! how fast those counters move, so every counter observation is run through a
//! [`RateProcessor`] which remembers the previous observation per metric key
//! and yields the per-second change since then.
//!
//! State is created lazily the first time a key is seen and is kept for the
//! lifetime of the processor. Nothing is persisted: after a restart every
//! counter's first rate reads as zero.

use std::time::Instant;

use rustc_hash::FxHashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Observation {
    value: i64,
    at: Instant,
}

/// Keyed store of the last observation of each counter.
///
/// Not synchronized. One poll cycle at a time may drive a processor.
#[derive(Debug, Default)]
pub struct RateProcessor {
    last: FxHashMap<String, Observation>,
}

impl RateProcessor {
    /// Create an empty [`RateProcessor`]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `value` for `key` at `now`, returning the per-second rate of
    /// change since the previous observation of `key`.
    ///
    /// The first observation of a key yields `0.0`. So does an observation
    /// taken no later than the previous one, and one whose value went
    /// backwards, which happens when the server restarts and its counters
    /// reset. In every case the observation becomes the new baseline.
    pub fn process(&mut self, key: &str, value: i64, now: Instant) -> f64 {
        let current = Observation { value, at: now };
        let Some(slot) = self.last.get_mut(key) else {
            self.last.insert(key.to_string(), current);
            return 0.0;
        };
        let previous = std::mem::replace(slot, current);

        let elapsed = now.saturating_duration_since(previous.at).as_secs_f64();
        if elapsed <= 0.0 {
            debug!("{key}: no time elapsed since previous observation");
            return 0.0;
        }
        if value < previous.value {
            debug!(
                "{key}: counter went from {} to {value}, assuming reset",
                previous.value
            );
            return 0.0;
        }
        value.abs_diff(previous.value) as f64 / elapsed
    }

    /// Whether `key` has been observed.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.last.contains_key(key)
    }

    /// Number of keys with recorded state.
    #[must_use]
    pub fn len(&self) -> usize {
        self.last.len()
    }

    /// Whether no key has been observed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}
