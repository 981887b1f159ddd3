//! Exchange timestamp helpers
//!
//! The exchange reports times as `2021-08-15T17:04:05.123Z[UTC]`.
//! The bracketed zone suffix is informational and dropped on parse.

use chrono::{DateTime, NaiveDateTime, Utc};

const EXCHANGE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Current wall-clock time in the exchange format.
pub fn format_exchange_time(t: DateTime<Utc>) -> String {
    format!("{}[UTC]", t.format(EXCHANGE_TIME_FORMAT))
}

/// Parse an exchange timestamp into unix seconds. Returns `None` for
/// timestamps that do not match the exchange format.
pub fn parse_exchange_time(timestamp: &str) -> Option<i64> {
    let trimmed = match timestamp.find('[') {
        Some(ix) => &timestamp[..ix],
        None => timestamp,
    };
    NaiveDateTime::parse_from_str(trimmed, EXCHANGE_TIME_FORMAT)
        .ok()
        .map(|t| t.and_utc().timestamp())
}

/// Unix seconds now.
pub fn unix_now() -> u64 {
    Utc::now().timestamp().max(0) as u64
}
