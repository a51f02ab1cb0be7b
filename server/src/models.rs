//! Data models for SkillSwap Server

use chrono::{FixedOffset, TimeZone};
use serde::{Deserialize, Serialize};
use skillswap_core::{DateInput, Meeting, RequestStatus, SessionRequest};

// ============================================================================
// User Models
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub email: String,
    pub key_hash: String,
    pub created_at: i64,
    pub is_active: bool,
}

// ============================================================================
// Auth Models
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub email: String,
    pub access_key: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: i64,
}

// ============================================================================
// Scheduling Rows
// ============================================================================

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RequestRow {
    pub id: i64,
    pub sender_email: String,
    pub receiver_email: String,
    pub scheduled_at: i64,
    pub duration: i64,
    pub status: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MeetingRow {
    pub id: i64,
    pub request_id: i64,
    pub participant_a: String,
    pub participant_b: String,
    pub scheduled_at: i64,
    pub duration: i64,
    pub created_at: i64,
}

/// Result of accepting a request.
#[derive(Debug, Clone)]
pub enum AcceptOutcome {
    Booked(MeetingRow),
    /// Already answered or expired.
    NotPending,
    /// The pair already has a live meeting.
    PairBusy,
}

impl MeetingRow {
    pub fn ends_at(&self) -> i64 {
        self.scheduled_at + self.duration * 60
    }

    pub fn involves(&self, email: &str) -> bool {
        self.participant_a == email || self.participant_b == email
    }
}

/// Unix seconds rendered as a local datetime in `zone`.
pub fn local_datetime(timestamp: i64, zone: &FixedOffset) -> DateInput {
    match zone.timestamp_opt(timestamp, 0).single() {
        Some(at) => DateInput::from_instant(&at),
        None => DateInput::Unknown(serde_json::Value::Null),
    }
}

fn parse_status(raw: &str) -> RequestStatus {
    serde_json::from_value(serde_json::Value::String(raw.to_string())).unwrap_or_default()
}

impl RequestRow {
    pub fn status(&self) -> RequestStatus {
        parse_status(&self.status)
    }

    pub fn into_wire(self, zone: &FixedOffset) -> SessionRequest {
        SessionRequest {
            id: self.id,
            scheduled_date_time: local_datetime(self.scheduled_at, zone),
            duration: u32::try_from(self.duration).unwrap_or_default(),
            status: parse_status(&self.status),
            sender_email: self.sender_email,
            receiver_email: self.receiver_email,
        }
    }
}

impl MeetingRow {
    pub fn into_wire(self, zone: &FixedOffset) -> Meeting {
        Meeting {
            id: self.id,
            scheduled_date_time: local_datetime(self.scheduled_at, zone),
            duration: u32::try_from(self.duration).unwrap_or_default(),
            participants: vec![self.participant_a, self.participant_b],
            title: None,
        }
    }
}

/// Status as stored in `session_requests.status`.
pub fn status_str(status: RequestStatus) -> &'static str {
    match status {
        RequestStatus::Pending => "pending",
        RequestStatus::Accepted => "accepted",
        RequestStatus::Rejected => "rejected",
        RequestStatus::Expired => "expired",
    }
}

// ============================================================================
// Admin / Cleanup
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub meetings_removed: u64,
    pub requests_expired: u64,
    pub sessions_removed: u64,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        self.meetings_removed == 0 && self.requests_expired == 0 && self.sessions_removed == 0
    }
}
