//! Time-related functions.

use std::time::{Duration, SystemTime};

fn since_unix_epoch() -> Duration {
    // A clock before the epoch yields a zero duration rather than an error.
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
}

/// Gets the current Unix timestamp, in seconds.
pub fn get_unix_timestamp() -> u64 {
    since_unix_epoch().as_secs()
}

/// Gets the current Unix timestamp, in milliseconds.
pub fn get_unix_timestamp_millis() -> u64 {
    since_unix_epoch().as_millis() as u64
}
