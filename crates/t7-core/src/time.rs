//! Wall-clock helpers
//!
//! Control messages carry a `time` field in Unix milliseconds, and the
//! round trip of each request is logged when its reply arrives.

use std::time::{SystemTime, UNIX_EPOCH};

/// Unix time in milliseconds, as stamped on outgoing control messages
///
/// A clock set before the epoch reads as 0.
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Milliseconds since `since`, saturating at 0 if the clock went backwards
pub fn elapsed_millis(since: u64) -> u64 {
    current_time_millis().saturating_sub(since)
}
