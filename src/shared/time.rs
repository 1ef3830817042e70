//! Clock helpers and the upstream's fixed datetime format.

use chrono::{DateTime, NaiveDateTime, Utc};

/// Wire format used by the upstream for `currentTime` / `cachedUntil`.
pub const API_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn now_unix_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn format_api_datetime(dt: DateTime<Utc>) -> String {
    dt.format(API_DATETIME_FORMAT).to_string()
}

/// Parse a `YYYY-MM-DD HH:MM:SS` timestamp, interpreted as UTC.
pub fn parse_api_datetime(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw.trim(), API_DATETIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::{format_api_datetime, parse_api_datetime};
    use chrono::{TimeZone, Utc};

    #[test]
    fn roundtrips_the_wire_format() {
        let dt = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let formatted = format_api_datetime(dt);
        assert_eq!(formatted, "2030-01-01 00:00:00");
        assert_eq!(parse_api_datetime(&formatted), Some(dt));
    }

    #[test]
    fn rejects_other_formats() {
        assert!(parse_api_datetime("2030-01-01T00:00:00Z").is_none());
        assert!(parse_api_datetime("not a time").is_none());
        assert!(parse_api_datetime("").is_none());
    }

    #[test]
    fn tolerates_surrounding_whitespace() {
        assert!(parse_api_datetime(" 2030-01-01 00:00:00 ").is_some());
    }
}
