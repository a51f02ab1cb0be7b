//! Session clock in the fixed reference timezone

use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};
use parking_lot::Mutex;

/// India Standard Time, the zone every schedule is computed in.
pub const DEFAULT_UTC_OFFSET_MINUTES: i32 = 330;

/// Source of "now" for slot generation and meeting classification.
pub trait Clock: Send + Sync {
    /// Current instant expressed in the reference timezone.
    fn now(&self) -> DateTime<FixedOffset>;

    /// The reference timezone itself.
    fn zone(&self) -> FixedOffset;
}

/// Builds the reference zone from a minute offset, falling back to UTC
/// when the offset is outside +/-24h.
pub fn reference_zone(offset_minutes: i32) -> FixedOffset {
    FixedOffset::east_opt(offset_minutes * 60).unwrap_or_else(|| Utc.fix())
}

/// Interprets a wall-clock reading as a local time in `zone`.
pub fn localize(zone: &FixedOffset, naive: NaiveDateTime) -> Option<DateTime<FixedOffset>> {
    zone.from_local_datetime(&naive).single()
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    zone: FixedOffset,
}

impl SystemClock {
    pub fn new(offset_minutes: i32) -> Self {
        Self {
            zone: reference_zone(offset_minutes),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new(DEFAULT_UTC_OFFSET_MINUTES)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.zone)
    }

    fn zone(&self) -> FixedOffset {
        self.zone
    }
}

/// Manually driven clock for deterministic schedules.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<FixedOffset>>,
}

impl FixedClock {
    pub fn new(now: DateTime<FixedOffset>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Clock pinned to a wall-clock reading in the default reference zone.
    pub fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> Self {
        let zone = reference_zone(DEFAULT_UTC_OFFSET_MINUTES);
        let now = zone
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .single()
            .unwrap_or_else(|| Utc::now().with_timezone(&zone));
        Self::new(now)
    }

    pub fn set(&self, now: DateTime<FixedOffset>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = *now + by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<FixedOffset> {
        *self.now.lock()
    }

    fn zone(&self) -> FixedOffset {
        *self.now.lock().offset()
    }
}
