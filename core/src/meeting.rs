//! Meeting lifecycle: status classification and countdowns

use std::fmt;

use chrono::{DateTime, Duration, FixedOffset};

use crate::models::{Meeting, MeetingStatus};

/// Classifies `now` against the window `[start, start + duration]`.
/// Both boundaries count as active.
pub fn classify(
    start: &DateTime<FixedOffset>,
    duration_minutes: u32,
    now: &DateTime<FixedOffset>,
) -> MeetingStatus {
    let end = *start + Duration::minutes(i64::from(duration_minutes));
    if now < start {
        MeetingStatus::Future
    } else if *now <= end {
        MeetingStatus::Active
    } else {
        MeetingStatus::Expired
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Countdown {
    StartsIn(i64),
    EndsIn(i64),
}

impl fmt::Display for Countdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Countdown::StartsIn(m) => write!(f, "starts in {} minutes", m),
            Countdown::EndsIn(m) => write!(f, "ends in {} minutes", m),
        }
    }
}

fn ceil_minutes(span: Duration) -> i64 {
    let secs = span.num_seconds().max(0);
    (secs + 59) / 60
}

impl Meeting {
    /// Start times are read in the zone of `now`. `None` when the start
    /// time cannot be parsed.
    pub fn status(&self, now: &DateTime<FixedOffset>) -> Option<MeetingStatus> {
        let start = self.starts_at(now.offset())?;
        Some(classify(&start, self.duration, now))
    }

    pub fn is_live(&self, now: &DateTime<FixedOffset>) -> bool {
        matches!(
            self.status(now),
            Some(MeetingStatus::Future) | Some(MeetingStatus::Active)
        )
    }

    pub fn is_joinable(&self, now: &DateTime<FixedOffset>) -> bool {
        self.status(now) == Some(MeetingStatus::Active)
    }

    /// Minutes until start (future) or until end (active), rounded up.
    pub fn countdown(&self, now: &DateTime<FixedOffset>) -> Option<Countdown> {
        let start = self.starts_at(now.offset())?;
        let end = self.ends_at(now.offset())?;
        match classify(&start, self.duration, now) {
            MeetingStatus::Future => Some(Countdown::StartsIn(ceil_minutes(start - *now))),
            MeetingStatus::Active => Some(Countdown::EndsIn(ceil_minutes(end - *now))),
            MeetingStatus::Expired => None,
        }
    }
}

/// Drops expired and unparseable meetings and orders the rest by start.
pub fn live_meetings(meetings: Vec<Meeting>, now: &DateTime<FixedOffset>) -> Vec<Meeting> {
    let zone = *now.offset();
    let mut live: Vec<Meeting> = meetings.into_iter().filter(|m| m.is_live(now)).collect();
    live.sort_by_key(|m| m.starts_at(&zone));
    live
}
