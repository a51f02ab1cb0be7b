//! Data models for SkillSwap sessions

use chrono::{DateTime, Duration, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::datetime::DateInput;

// ============================================================================
// Session requests
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    #[default]
    Pending,
    Accepted,
    Rejected,
    Expired,
}

impl<'de> Deserialize<'de> for RequestStatus {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        match raw.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "rejected" | "declined" => Ok(Self::Rejected),
            "expired" => Ok(Self::Expired),
            other => Err(serde::de::Error::unknown_variant(
                other,
                &["pending", "accepted", "rejected", "expired"],
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    #[serde(alias = "requestId")]
    pub id: i64,
    pub sender_email: String,
    pub receiver_email: String,
    pub scheduled_date_time: DateInput,
    pub duration: u32,
    #[serde(default)]
    pub status: RequestStatus,
}

impl SessionRequest {
    pub fn is_pending(&self) -> bool {
        self.status == RequestStatus::Pending
    }

    pub fn scheduled_at(&self, zone: &FixedOffset) -> Option<DateTime<FixedOffset>> {
        self.scheduled_date_time.resolve(zone)
    }
}

/// Body of `POST {prefix}/request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionRequest {
    pub receiver_email: String,
    pub scheduled_date_time: DateInput,
    pub duration: u32,
}

// ============================================================================
// Meetings
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingStatus {
    Future,
    Active,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meeting {
    pub id: i64,
    #[serde(default)]
    pub participants: Vec<String>,
    pub scheduled_date_time: DateInput,
    pub duration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl Meeting {
    pub fn starts_at(&self, zone: &FixedOffset) -> Option<DateTime<FixedOffset>> {
        self.scheduled_date_time.resolve(zone)
    }

    pub fn ends_at(&self, zone: &FixedOffset) -> Option<DateTime<FixedOffset>> {
        self.starts_at(zone)
            .map(|start| start + Duration::minutes(i64::from(self.duration)))
    }

    /// The participant that is not `me`.
    pub fn other_participant(&self, me: &str) -> Option<&str> {
        self.participants
            .iter()
            .map(String::as_str)
            .find(|p| !p.eq_ignore_ascii_case(me))
    }

    pub fn involves(&self, email: &str) -> bool {
        self.participants.iter().any(|p| p.eq_ignore_ascii_case(email))
    }
}

// ============================================================================
// Slots
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    /// `YYYY-MM-DD` in the reference zone.
    pub date: String,
    /// `HH:00`
    pub time: String,
    /// `H:00`
    pub display: String,
}

// ============================================================================
// Auth
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSession {
    pub token: String,
    pub email: String,
    pub expires_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::reference_zone;
    use serde_json::json;

    #[test]
    fn test_request_accepts_request_id_alias_and_uppercase_status() {
        let req: SessionRequest = serde_json::from_value(json!({
            "requestId": 7,
            "senderEmail": "a@x.io",
            "receiverEmail": "b@x.io",
            "scheduledDateTime": [2025, 3, 14, 10, 0],
            "duration": 30,
            "status": "PENDING"
        }))
        .unwrap();

        assert_eq!(req.id, 7);
        assert!(req.is_pending());
        assert!(req.scheduled_at(&reference_zone(330)).is_some());
    }

    #[test]
    fn test_missing_status_reads_as_pending() {
        let req: SessionRequest = serde_json::from_value(json!({
            "id": 8,
            "senderEmail": "a@x.io",
            "receiverEmail": "b@x.io",
            "scheduledDateTime": "2025-03-14T10:00:00",
            "duration": 30
        }))
        .unwrap();

        assert_eq!(req.status, RequestStatus::Pending);
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let res = serde_json::from_value::<RequestStatus>(json!("maybe"));
        assert!(res.is_err());
    }

    #[test]
    fn test_meeting_other_participant() {
        let meeting: Meeting = serde_json::from_value(json!({
            "id": 1,
            "participants": ["a@x.io", "b@x.io"],
            "scheduledDateTime": "2025-03-14T10:00:00",
            "duration": 45
        }))
        .unwrap();

        assert_eq!(meeting.other_participant("A@x.io"), Some("b@x.io"));
        assert!(meeting.involves("b@x.io"));
        let zone = reference_zone(330);
        let span = meeting.ends_at(&zone).unwrap() - meeting.starts_at(&zone).unwrap();
        assert_eq!(span.num_minutes(), 45);
    }
}
