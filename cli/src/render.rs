//! Plain-text rendering of schedules and meetings

use chrono::{DateTime, FixedOffset};
use skillswap_core::datetime::LOCAL_DATETIME_FORMAT;
use skillswap_core::schedule::BoardEntry;
use skillswap_core::{MeetingStatus, PairSnapshot, PendingView, TimeSlot};

/// One line per date: `2025-03-14  10:00 11:00 ...`
pub fn slots(slots: &[TimeSlot]) -> Vec<String> {
    let mut lines: Vec<(String, Vec<&str>)> = Vec::new();
    for slot in slots {
        match lines.last_mut() {
            Some((date, hours)) if *date == slot.date => hours.push(slot.display.as_str()),
            _ => lines.push((slot.date.clone(), vec![slot.display.as_str()])),
        }
    }
    lines
        .into_iter()
        .map(|(date, hours)| format!("{}  {}", date, hours.join(" ")))
        .collect()
}

pub fn pending(view: &PendingView, peer: &str) -> String {
    match view {
        PendingView::None => "No pending request".to_string(),
        PendingView::Sent {
            id,
            scheduled,
            duration,
        } => format!(
            "Request #{} sent to {} for {} ({} min), waiting for an answer",
            id, peer, scheduled, duration
        ),
        PendingView::Received {
            id,
            scheduled,
            duration,
        } => format!(
            "Request #{} from {} for {} ({} min), accept or reject it",
            id, peer, scheduled, duration
        ),
    }
}

/// State of the pair as of `now`.
pub fn snapshot(snapshot: &PairSnapshot, me: &str, peer: &str, now: &DateTime<FixedOffset>) -> Vec<String> {
    let mut lines = vec![pending(&snapshot.pending_view(me, now.offset()), peer)];

    match &snapshot.meeting {
        Some(meeting) => {
            let start = meeting
                .starts_at(now.offset())
                .map(|at| at.format(LOCAL_DATETIME_FORMAT).to_string())
                .unwrap_or_else(|| "unknown time".to_string());
            let countdown = meeting
                .countdown(now)
                .map(|c| c.to_string())
                .unwrap_or_default();
            let join = if meeting.is_joinable(now) {
                format!(", ready to join with `skillswap join {}`", meeting.id)
            } else {
                String::new()
            };
            lines.push(format!(
                "Meeting #{} at {} ({} min), {}{}",
                meeting.id, start, meeting.duration, countdown, join
            ));
        }
        None => lines.push("No meeting scheduled".to_string()),
    }

    if snapshot.can_schedule() {
        lines.push(format!("You can request a session with {}", peer));
    }
    lines
}

pub fn board(entries: &[BoardEntry], zone: &FixedOffset) -> Vec<String> {
    if entries.is_empty() {
        return vec!["No upcoming meetings".to_string()];
    }

    entries
        .iter()
        .map(|entry| {
            let start = entry
                .meeting
                .starts_at(zone)
                .map(|at| at.format(LOCAL_DATETIME_FORMAT).to_string())
                .unwrap_or_default();
            let status = match entry.status {
                MeetingStatus::Future => "upcoming",
                MeetingStatus::Active => "active",
                MeetingStatus::Expired => "ended",
            };
            let countdown = entry.countdown.map(|c| format!(", {}", c)).unwrap_or_default();
            format!(
                "#{:<5} {}  with {}  {} min  [{}{}]",
                entry.meeting.id, start, entry.with, entry.meeting.duration, status, countdown
            )
        })
        .collect()
}
