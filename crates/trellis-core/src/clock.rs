//! Hybrid logical clock (HLC).
//!
//! A [`Timestamp`] packs a wall-clock microsecond component and a 16-bit
//! logical counter into a single `u64`, totally ordered by plain integer
//! comparison. The counter bridges bursts of events that land inside the
//! same wall-clock slot, and lets the clock stay monotonic when the wall
//! clock stalls or steps backwards slightly.
//!
//! # Guarantees
//!
//! - Any two timestamps produced or tracked by the same [`Clock`] instance
//!   are totally ordered.
//! - Every [`Clock::now`] result is strictly greater than every prior
//!   `now()` result and every prior [`Clock::track`] input.
//!
//! A `Clock` is *not* safe for concurrent use; callers needing that must
//! add their own exclusion.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CrdtError, Result};

/// Number of low bits reserved for the logical counter.
const COUNTER_BITS: u32 = 16;

/// Mask selecting the logical counter.
const COUNTER_MASK: u64 = (1 << COUNTER_BITS) - 1;

/// Maximum tolerated lag of the wall clock behind the tracked maximum,
/// in microseconds (5 minutes). Beyond this, bridging via the logical
/// counter is considered unsafe and [`Clock::now`] fails.
pub const MAX_SKEW_US: u64 = 300 * 1_000_000;

// ---------------------------------------------------------------------------
// Timestamp
// ---------------------------------------------------------------------------

/// A hybrid logical timestamp.
///
/// The upper 48 bits carry the wall-clock time in microseconds rounded
/// down to the counter granularity; the lower 16 bits carry the logical
/// counter. Serialized as a plain integer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The zero timestamp, ordered before every real timestamp.
    pub const ZERO: Self = Self(0);

    /// Build a timestamp from a raw packed value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Build a timestamp from a wall-clock microsecond reading, with a
    /// zero counter. The reading is rounded down to counter granularity.
    #[must_use]
    pub const fn from_wall(wall_us: u64) -> Self {
        Self(wall_us & !COUNTER_MASK)
    }

    /// The raw packed value.
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// The wall-clock component in microseconds (counter bits zeroed).
    #[must_use]
    pub const fn wall_micros(self) -> u64 {
        self.0 & !COUNTER_MASK
    }

    /// The logical counter component.
    #[must_use]
    pub const fn counter(self) -> u16 {
        (self.0 & COUNTER_MASK) as u16
    }

    /// The immediately following timestamp, saturating at the end of the
    /// key space.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// The immediately following timestamp, or `None` when the key space
    /// is exhausted.
    #[must_use]
    pub const fn checked_next(self) -> Option<Self> {
        match self.0.checked_add(1) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }

    /// Wall-clock component as a UTC datetime, for logs and display.
    #[must_use]
    pub fn time(self) -> DateTime<Utc> {
        // Packed micros fit in i64 until far beyond year 9999.
        #[allow(clippy::cast_possible_wrap)]
        let micros = self.wall_micros() as i64;
        Utc.timestamp_micros(micros).single().unwrap_or_default()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// A hybrid logical clock tracking the maximum timestamp observed so far.
///
/// Created once per actor/session and mutated on every tick.
#[derive(Debug, Clone, Default)]
pub struct Clock {
    max: Timestamp,
}

impl Clock {
    /// Create a clock with no tracked history.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max: Timestamp::ZERO,
        }
    }

    /// Create a clock pre-seeded with a tracked maximum, used when
    /// reconstructing state from persisted changes.
    #[must_use]
    pub const fn at(max: Timestamp) -> Self {
        Self { max }
    }

    /// The maximum timestamp produced or tracked so far.
    #[must_use]
    pub const fn max(&self) -> Timestamp {
        self.max
    }

    /// Produce the next timestamp, strictly greater than everything seen.
    ///
    /// # Errors
    ///
    /// [`CrdtError::ClockSkewExceeded`] when the local wall clock has
    /// fallen more than [`MAX_SKEW_US`] behind the tracked maximum, which
    /// would force the logical counter to run unboundedly ahead of real
    /// time.
    pub fn now(&mut self) -> Result<Timestamp> {
        let wall_us = wall_clock_micros()?;
        let rounded = Timestamp::from_wall(wall_us);

        let ts = if rounded > self.max {
            rounded
        } else {
            // Bridging would run the counter ahead of real time; check the
            // lag before touching the counter so an absurd tracked maximum
            // can never overflow it.
            if self.max.wall_micros().saturating_sub(wall_us) > MAX_SKEW_US {
                return Err(CrdtError::ClockSkewExceeded {
                    wall_us,
                    max: self.max,
                });
            }
            let Some(candidate) = self.max.checked_next() else {
                return Err(CrdtError::ClockSkewExceeded {
                    wall_us,
                    max: self.max,
                });
            };
            candidate
        };

        self.max = ts;
        Ok(ts)
    }

    /// Record a timestamp authored elsewhere, advancing the tracked
    /// maximum if `remote` is greater.
    pub fn track(&mut self, remote: Timestamp) {
        if remote > self.max {
            self.max = remote;
        }
    }
}

/// Current wall-clock time as microseconds since the Unix epoch.
fn wall_clock_micros() -> Result<u64> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| CrdtError::Internal("system clock is before the Unix epoch".into()))?;
    // Microseconds since 1970 fit comfortably in u64.
    #[allow(clippy::cast_possible_truncation)]
    let micros = elapsed.as_micros() as u64;
    Ok(micros)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
