//! Wall-clock helpers.
//!
//! The whole protocol runs on unix-epoch milliseconds so timestamps can be
//! persisted in the node table and truncated onto the wire without any
//! Instant-to-calendar conversion.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Current unix time in seconds, truncated to u32 for gossip facts.
pub fn now_secs() -> u32 {
    (now_ms() / 1000) as u32
}
