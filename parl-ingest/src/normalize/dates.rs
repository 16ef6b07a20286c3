//! Date and timestamp parsing
//!
//! Stored timestamps are always UTC. A source timestamp without an offset is
//! only accepted when the source's offset has been configured.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone};

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Parse a timestamp, keeping the source offset
///
/// Accepts RFC 3339 (any offset). Naive forms are interpreted in
/// `assumed_offset`, or rejected when it is `None`.
pub fn parse_timestamp(raw: &str, assumed_offset: Option<FixedOffset>) -> Result<DateTime<FixedOffset>, String> {
    let raw = raw.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts);
    }

    let naive = NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .ok_or_else(|| format!("unparseable timestamp '{}'", raw))?;

    let offset = assumed_offset
        .ok_or_else(|| format!("timestamp '{}' has no UTC offset and no source offset is configured", raw))?;

    offset
        .from_local_datetime(&naive)
        .single()
        .ok_or_else(|| format!("timestamp '{}' is ambiguous in the source offset", raw))
}

/// Parse a calendar date
///
/// Full timestamps are accepted and reduced to their date in the source's
/// own offset.
pub fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    let raw = raw.trim();

    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(date);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.date_naive());
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|dt| dt.date())
        .ok_or_else(|| format!("unparseable date '{}'", raw))
}

/// Offset from configured minutes east of UTC
pub fn offset_from_minutes(minutes: i32) -> Option<FixedOffset> {
    FixedOffset::east_opt(minutes.checked_mul(60)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parl_common::time::format_timestamp;

    #[test]
    fn rfc3339_is_converted_to_utc() {
        let ts = parse_timestamp("2023-05-02T14:05:00-04:00", None).unwrap();
        assert_eq!(format_timestamp(&ts.with_timezone(&Utc)), "2023-05-02T18:05:00.000000Z");
    }

    #[test]
    fn naive_timestamp_needs_configured_offset() {
        let err = parse_timestamp("2023-05-02 14:05:00", None).unwrap_err();
        assert!(err.contains("no UTC offset"));

        let eastern = offset_from_minutes(-240);
        let ts = parse_timestamp("2023-05-02 14:05:00", eastern).unwrap();
        assert_eq!(format_timestamp(&ts.with_timezone(&Utc)), "2023-05-02T18:05:00.000000Z");
    }

    #[test]
    fn garbage_timestamp_is_rejected() {
        assert!(parse_timestamp("around noon", offset_from_minutes(0)).is_err());
    }

    #[test]
    fn dates_accept_timestamps_in_local_terms() {
        assert_eq!(parse_date("2023-05-02").unwrap(), NaiveDate::from_ymd_opt(2023, 5, 2).unwrap());
        // 22:30 in Ottawa is already the next day in UTC; the sitting date is local
        assert_eq!(
            parse_date("2023-05-02T22:30:00-04:00").unwrap(),
            NaiveDate::from_ymd_opt(2023, 5, 2).unwrap()
        );
        assert!(parse_date("02/05/2023").is_err());
    }
}
