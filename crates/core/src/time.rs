use chrono::{DateTime, Utc};

/// Parses a Slack message timestamp (`"1712345678.000200"`, seconds with a
/// fractional part) into a UTC instant, floored to millisecond precision.
/// Returns `None` for anything non-numeric.
pub fn parse_slack_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let seconds: f64 = raw.parse().ok()?;
    if !seconds.is_finite() {
        return None;
    }
    DateTime::from_timestamp_millis((seconds * 1000.0).floor() as i64)
}

/// Renders an instant as a Slack timestamp string (whole seconds), as used
/// for the `oldest` history bound.
pub fn to_slack_timestamp(at: DateTime<Utc>) -> String {
    at.timestamp().to_string()
}
