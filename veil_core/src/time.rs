//! Functions to work with time.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Returns an `Instant` corresponding to "now". Should be used instead of
/// `Instant::now()` so tests can mock time via `tokio::time::pause`.
pub fn clock_now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Returns the amount of time elapsed since this instant was created. Should
/// be used instead of `Instant::elapsed` in order to work with the mocked
/// clock.
pub fn clock_elapsed(time: Instant) -> Duration {
    clock_now() - time
}

/// Return number of milliseconds that have elapsed since the unix epoch.
pub fn unix_time_ms(time: SystemTime) -> u64 {
    let since_the_epoch = time
        .duration_since(UNIX_EPOCH)
        .expect("Current time is earlier than Unix epoch");
    since_the_epoch.as_millis() as u64
}
