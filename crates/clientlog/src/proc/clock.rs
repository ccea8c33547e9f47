// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Timestamp formatting shared by the enricher and the backends.

use time::{format_description::well_known::Rfc3339, OffsetDateTime, UtcOffset};

/// `2024-05-01T12:30:45.123456789Z`: RFC 3339, UTC, nanosecond precision.
#[must_use]
pub fn rfc3339_nanos(at: OffsetDateTime) -> String {
    let at = at.to_offset(UtcOffset::UTC);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:09}Z",
        at.year(),
        u8::from(at.month()),
        at.day(),
        at.hour(),
        at.minute(),
        at.second(),
        at.nanosecond()
    )
}

#[must_use]
pub fn now_rfc3339_nanos() -> String {
    rfc3339_nanos(OffsetDateTime::now_utc())
}

/// `20240501T123045.123456789Z`, safe for use in file names.
#[must_use]
pub fn compact_timestamp(at: OffsetDateTime) -> String {
    let at = at.to_offset(UtcOffset::UTC);
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}.{:09}Z",
        at.year(),
        u8::from(at.month()),
        at.day(),
        at.hour(),
        at.minute(),
        at.second(),
        at.nanosecond()
    )
}

/// Inverse of [`compact_timestamp`]. Anything else is rejected.
#[must_use]
pub fn parse_compact_timestamp(s: &str) -> Option<OffsetDateTime> {
    let bytes = s.as_bytes();
    if bytes.len() != 26 || bytes[8] != b'T' || bytes[15] != b'.' || bytes[25] != b'Z' {
        return None;
    }
    let digits = |range: std::ops::Range<usize>| bytes[range].iter().all(u8::is_ascii_digit);
    if !(digits(0..8) && digits(9..15) && digits(16..25)) {
        return None;
    }
    let expanded = format!(
        "{}-{}-{}T{}:{}:{}.{}Z",
        &s[0..4],
        &s[4..6],
        &s[6..8],
        &s[9..11],
        &s[11..13],
        &s[13..15],
        &s[16..25]
    );
    OffsetDateTime::parse(&expanded, &Rfc3339).ok()
}

/// Fractional Unix seconds of an RFC 3339 timestamp.
#[must_use]
pub fn unix_seconds(rfc3339: &str) -> Option<f64> {
    let at = OffsetDateTime::parse(rfc3339, &Rfc3339).ok()?;
    #[allow(clippy::cast_precision_loss)]
    let seconds = at.unix_timestamp_nanos() as f64 / 1e9;
    Some(seconds)
}

#[must_use]
pub fn now_unix_seconds() -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let seconds = OffsetDateTime::now_utc().unix_timestamp_nanos() as f64 / 1e9;
    seconds
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc3339_nanos_layout() {
        let at = OffsetDateTime::from_unix_timestamp_nanos(1_714_566_645_000_000_001).unwrap();
        assert_eq!(rfc3339_nanos(at), "2024-05-01T12:30:45.000000001Z");
        assert_eq!(compact_timestamp(at), "20240501T123045.000000001Z");
    }

    #[test]
    fn test_parse_compact_timestamp() {
        let at = OffsetDateTime::from_unix_timestamp_nanos(1_714_566_645_000_000_001).unwrap();
        assert_eq!(parse_compact_timestamp(&compact_timestamp(at)), Some(at));
        assert!(parse_compact_timestamp("errors").is_none());
        assert!(parse_compact_timestamp("20240501T123045.00000000Z").is_none());
        assert!(parse_compact_timestamp("20241301T123045.000000001Z").is_none());
        assert!(parse_compact_timestamp("2024050xT123045.000000001Z").is_none());
    }

    #[test]
    fn test_round_trip_to_unix_seconds() {
        let at = OffsetDateTime::from_unix_timestamp_nanos(1_714_566_645_250_000_000).unwrap();
        let seconds = unix_seconds(&rfc3339_nanos(at)).unwrap();
        assert!((seconds - 1_714_566_645.25).abs() < 1e-6);
        assert!(unix_seconds("yesterday").is_none());
    }
}
