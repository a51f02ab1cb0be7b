//! `scheduledDateTime` wire format
//!
//! The server sends either a local-datetime string without offset
//! (`2025-03-14T09:30:00`) or a numeric array `[year, month, day, hour,
//! minute]` with a 1-based month. Both are read in the reference timezone.
//! Anything else is kept as `Unknown` and resolves to no instant.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::clock::localize;

/// Outbound format for scheduled instants.
pub const LOCAL_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

const ACCEPTED_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

#[derive(Debug, Clone, PartialEq)]
pub enum DateInput {
    IsoString(String),
    Components {
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        minute: u32,
        second: u32,
    },
    Unknown(Value),
}

impl DateInput {
    pub fn from_instant(instant: &DateTime<FixedOffset>) -> Self {
        DateInput::IsoString(instant.format(LOCAL_DATETIME_FORMAT).to_string())
    }

    /// Wall-clock reading, independent of any zone.
    pub fn to_naive(&self) -> Option<NaiveDateTime> {
        match self {
            DateInput::IsoString(raw) => parse_local(raw),
            DateInput::Components {
                year,
                month,
                day,
                hour,
                minute,
                second,
            } => NaiveDate::from_ymd_opt(*year, *month, *day)?.and_hms_opt(*hour, *minute, *second),
            DateInput::Unknown(_) => None,
        }
    }

    /// Absolute instant in the reference zone, or `None` when unparseable.
    pub fn resolve(&self, zone: &FixedOffset) -> Option<DateTime<FixedOffset>> {
        self.to_naive().and_then(|naive| localize(zone, naive))
    }

    fn from_value(value: Value) -> Self {
        match &value {
            Value::String(raw) => return DateInput::IsoString(raw.clone()),
            Value::Array(parts) if parts.len() >= 5 => {
                if let Some(input) = components(parts) {
                    return input;
                }
            }
            _ => {}
        }
        DateInput::Unknown(value)
    }
}

fn parse_local(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    ACCEPTED_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
        .map(|dt| dt.with_nanosecond(0).unwrap_or(dt))
}

fn components(parts: &[Value]) -> Option<DateInput> {
    let mut nums = parts.iter().map(Value::as_i64);
    let year = i32::try_from(nums.next()??).ok()?;
    let month = u32::try_from(nums.next()??).ok()?;
    let day = u32::try_from(nums.next()??).ok()?;
    let hour = u32::try_from(nums.next()??).ok()?;
    let minute = u32::try_from(nums.next()??).ok()?;
    let second = match nums.next() {
        Some(Some(s)) => u32::try_from(s).ok()?,
        Some(None) => return None,
        None => 0,
    };

    Some(DateInput::Components {
        year,
        month,
        day,
        hour,
        minute,
        second,
    })
}

impl<'de> Deserialize<'de> for DateInput {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Ok(DateInput::from_value(value))
    }
}

impl Serialize for DateInput {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            DateInput::IsoString(raw) => serializer.serialize_str(raw),
            DateInput::Components { .. } => match self.to_naive() {
                Some(naive) => serializer.serialize_str(&naive.format(LOCAL_DATETIME_FORMAT).to_string()),
                None => serializer.serialize_none(),
            },
            DateInput::Unknown(value) => value.serialize(serializer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::reference_zone;
    use serde_json::json;

    fn ist() -> FixedOffset {
        reference_zone(330)
    }

    #[test]
    fn test_array_and_string_resolve_to_same_instant() {
        let from_array: DateInput = serde_json::from_value(json!([2025, 3, 14, 9, 30])).unwrap();
        let from_string: DateInput = serde_json::from_value(json!("2025-03-14T09:30:00")).unwrap();

        let a = from_array.resolve(&ist()).unwrap();
        let b = from_string.resolve(&ist()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.timestamp(), b.timestamp());
    }

    #[test]
    fn test_string_is_read_in_reference_zone() {
        let input = DateInput::IsoString("2025-03-14T09:30:00".to_string());
        let instant = input.resolve(&ist()).unwrap();
        assert_eq!(instant.naive_utc().to_string(), "2025-03-14 04:00:00");
    }

    #[test]
    fn test_accepts_short_and_fractional_strings() {
        let short = DateInput::IsoString("2025-03-14T09:30".to_string());
        let fractional = DateInput::IsoString("2025-03-14T09:30:00.123".to_string());
        assert_eq!(short.resolve(&ist()), fractional.resolve(&ist()));
    }

    #[test]
    fn test_array_with_seconds() {
        let input: DateInput = serde_json::from_value(json!([2025, 3, 14, 9, 30, 15])).unwrap();
        let naive = input.to_naive().unwrap();
        assert_eq!(naive.format(LOCAL_DATETIME_FORMAT).to_string(), "2025-03-14T09:30:15");
    }

    #[test]
    fn test_unparseable_inputs_are_absent() {
        for raw in [
            json!("not a date"),
            json!([2025, 13, 40, 9, 30]),
            json!([2025, 3]),
            json!(["2025", 3, 14, 9, 30]),
            json!(1741924800),
            json!(null),
        ] {
            let input: DateInput = serde_json::from_value(raw.clone()).unwrap();
            assert!(input.resolve(&ist()).is_none(), "{raw} should not resolve");
        }
    }

    #[test]
    fn test_components_serialize_as_local_string() {
        let input: DateInput = serde_json::from_value(json!([2025, 3, 14, 9, 30])).unwrap();
        assert_eq!(serde_json::to_value(&input).unwrap(), json!("2025-03-14T09:30:00"));
    }
}
