//! Reservation slot generator
//!
//! Slots are whole hours inside business hours over a rolling horizon. For
//! the current day only hours after the current one are offered, so a slot
//! is never at or before `now`.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, Timelike};
use serde::{Deserialize, Serialize};

use crate::clock::localize;
use crate::error::{Error, Result};
use crate::models::TimeSlot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotWindow {
    pub start_hour: u32,
    /// Inclusive.
    pub end_hour: u32,
    pub horizon_days: u32,
}

impl Default for SlotWindow {
    fn default() -> Self {
        Self {
            start_hour: 8,
            end_hour: 22,
            horizon_days: 7,
        }
    }
}

impl SlotWindow {
    pub fn new(start_hour: u32, end_hour: u32, horizon_days: u32) -> Self {
        let end_hour = end_hour.min(23);
        Self {
            start_hour: start_hour.min(end_hour),
            end_hour,
            horizon_days,
        }
    }

    pub fn generate(&self, now: &DateTime<FixedOffset>) -> Vec<TimeSlot> {
        let today = now.date_naive();
        let first_today = (now.hour() + 1).max(self.start_hour);
        let mut slots = Vec::new();

        for offset in 0..self.horizon_days {
            let Some(date) = today.checked_add_signed(Duration::days(i64::from(offset))) else {
                break;
            };
            let from = if offset == 0 { first_today } else { self.start_hour };
            for hour in from..=self.end_hour {
                slots.push(TimeSlot::new(date, hour));
            }
        }

        slots
    }

    /// Distinct dates that still have at least one slot, in order.
    pub fn dates(&self, now: &DateTime<FixedOffset>) -> Vec<String> {
        let mut dates: Vec<String> = Vec::new();
        for slot in self.generate(now) {
            if dates.last() != Some(&slot.date) {
                dates.push(slot.date);
            }
        }
        dates
    }

    /// Picks the generated slot for `date` (`YYYY-MM-DD`) and `hour`.
    pub fn find(&self, now: &DateTime<FixedOffset>, date: &str, hour: u32) -> Option<TimeSlot> {
        self.generate(now)
            .into_iter()
            .find(|slot| slot.date == date && slot.hour() == Some(hour))
    }
}

impl TimeSlot {
    pub fn new(date: NaiveDate, hour: u32) -> Self {
        Self {
            date: format!("{:04}-{:02}-{:02}", date.year(), date.month(), date.day()),
            time: format!("{:02}:00", hour),
            display: format!("{}:00", hour),
        }
    }

    /// Builds a slot from user input, validating both parts.
    pub fn parse(date: &str, time: &str) -> Result<Self> {
        let day = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d")
            .map_err(|_| Error::Validation(format!("Invalid date: {}", date)))?;
        let hour = time
            .trim()
            .split(':')
            .next()
            .and_then(|h| h.parse::<u32>().ok())
            .filter(|h| *h < 24)
            .ok_or_else(|| Error::Validation(format!("Invalid time: {}", time)))?;
        Ok(Self::new(day, hour))
    }

    pub fn hour(&self) -> Option<u32> {
        self.time.split(':').next()?.parse().ok()
    }

    /// The slot's start as an absolute instant in `zone`.
    pub fn resolve(&self, zone: &FixedOffset) -> Option<DateTime<FixedOffset>> {
        let date = NaiveDate::parse_from_str(&self.date, "%Y-%m-%d").ok()?;
        let naive = date.and_hms_opt(self.hour()?, 0, 0)?;
        localize(zone, naive)
    }
}
