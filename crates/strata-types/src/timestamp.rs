//! `X-Timestamp` parsing and formatting.
//!
//! Timestamps travel as Swift-style decimal strings (`"1700000000.12345"`)
//! and are stored as nanoseconds since the Unix epoch.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::TypesError;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Resolution of the formatted fraction: 5 digits = 10 microseconds.
const FRACTION_UNIT: i64 = 10_000;

/// Parse an `X-Timestamp` string into nanoseconds.
///
/// Accepts a bare integer, any number of fractional digits (extra digits
/// beyond nanoseconds are truncated), and ignores a Swift `_offset` suffix.
pub fn parse_timestamp(s: &str) -> Result<i64, TypesError> {
    let invalid = || TypesError::InvalidTimestamp(s.to_string());

    let s = s.trim();
    let s = s.split_once('_').map_or(s, |(ts, _offset)| ts);
    if s.is_empty() {
        return Err(invalid());
    }

    let (secs, frac) = match s.split_once('.') {
        Some((secs, frac)) => (secs, frac),
        None => (s, ""),
    };

    if secs.is_empty() || !secs.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    if !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    let secs: i64 = secs.parse().map_err(|_| invalid())?;

    let mut nanos: i64 = 0;
    let mut scale = NANOS_PER_SEC / 10;
    for digit in frac.bytes().take(9) {
        nanos += i64::from(digit - b'0') * scale;
        scale /= 10;
    }

    secs.checked_mul(NANOS_PER_SEC)
        .and_then(|n| n.checked_add(nanos))
        .ok_or_else(invalid)
}

/// Format nanoseconds as an `X-Timestamp` string (`"<secs>.<5 digits>"`).
pub fn format_timestamp(nanos: i64) -> String {
    let secs = nanos.div_euclid(NANOS_PER_SEC);
    let frac = nanos.rem_euclid(NANOS_PER_SEC) / FRACTION_UNIT;
    format!("{secs}.{frac:05}")
}

/// Current wall-clock time in nanoseconds.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}
