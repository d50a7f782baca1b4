/// Utility functions for timestamps, wire encoding helpers and cadence math
use std::time::Duration;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

/// Format a timestamp for human-readable logging
///
/// Converts an OffsetDateTime to DD.MM.YYYY - HH:MM:SS format
/// Falls back to default string representation if formatting fails.
pub fn format_datetime(dt: &OffsetDateTime) -> String {
    let format = format_description!("[day].[month].[year] - [hour]:[minute]:[second]");
    dt.format(format).unwrap_or_else(|_| dt.to_string())
}

/// Format a timestamp the way the collector expects it (UTC, no offset)
pub fn format_wire_timestamp(dt: &OffsetDateTime) -> Result<String, time::error::Format> {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    dt.to_offset(UtcOffset::UTC).format(format)
}

/// Time left to sleep so that cycles start roughly `interval` apart
///
/// Never returns less than `min_sleep`, even when a cycle overran.
pub fn cycle_sleep(interval: Duration, elapsed: Duration, min_sleep: Duration) -> Duration {
    interval.saturating_sub(elapsed).max(min_sleep)
}

/// Serde adapter for the `YYYY-MM-DD HH:MM:SS` UTC timestamps on the wire
pub mod timestamp {
    use serde::de::Error as _;
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use time::macros::format_description;
    use time::{OffsetDateTime, PrimitiveDateTime};

    pub fn serialize<S: Serializer>(dt: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        let text = super::format_wire_timestamp(dt).map_err(S::Error::custom)?;
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<OffsetDateTime, D::Error> {
        let text = String::deserialize(deserializer)?;
        let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
        PrimitiveDateTime::parse(&text, format)
            .map(PrimitiveDateTime::assume_utc)
            .map_err(D::Error::custom)
    }
}

/// Accept site identifiers sent either as JSON strings or numbers
pub fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    use serde::Deserialize;

    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(D::Error::custom(format!(
            "expected string or number identifier, got {}",
            other
        ))),
    }
}
