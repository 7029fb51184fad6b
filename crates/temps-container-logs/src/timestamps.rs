//! Timestamp rendering and `since` filter parsing

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

use crate::error::LogsError;
use crate::message::UtcDateTime;

/// Renders a record timestamp with a fixed nine digit fraction so that
/// prefixed lines stay column aligned, e.g. `2024-01-02T03:04:05.000000006Z`.
pub fn format_timestamp(ts: &UtcDateTime) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parses a `since` filter value.
///
/// An empty value means no lower bound. Accepted forms are Unix seconds with
/// an optional fraction (`1700000000`, `1700000000.5`) and RFC 3339.
pub fn parse_since(value: &str) -> Result<Option<UtcDateTime>, LogsError> {
    if value.is_empty() {
        return Ok(None);
    }

    if value.contains('T') {
        return DateTime::parse_from_rfc3339(value)
            .map(|ts| Some(ts.with_timezone(&Utc)))
            .map_err(|e| invalid(value, e.to_string()));
    }

    let (secs, nanos) = parse_unix_timestamp(value)?;
    Utc.timestamp_opt(secs, nanos)
        .single()
        .map(Some)
        .ok_or_else(|| invalid(value, "timestamp out of range".to_string()))
}

fn parse_unix_timestamp(value: &str) -> Result<(i64, u32), LogsError> {
    let (secs, fraction) = match value.split_once('.') {
        Some((secs, fraction)) => (secs, Some(fraction)),
        None => (value, None),
    };

    let secs = secs
        .parse::<i64>()
        .map_err(|e| invalid(value, e.to_string()))?;

    let nanos = match fraction {
        None => 0,
        Some(f) if f.is_empty() || f.len() > 9 || !f.bytes().all(|b| b.is_ascii_digit()) => {
            return Err(invalid(
                value,
                "fraction must be 1 to 9 decimal digits".to_string(),
            ));
        }
        Some(f) => {
            let digits = f
                .parse::<u32>()
                .map_err(|e| invalid(value, e.to_string()))?;
            digits * 10u32.pow(9 - f.len() as u32)
        }
    };

    Ok((secs, nanos))
}

fn invalid(value: &str, reason: String) -> LogsError {
    LogsError::InvalidTimestamp {
        value: value.to_string(),
        reason,
    }
}
