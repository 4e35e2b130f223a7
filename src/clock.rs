/**
Millisecond clock for status timestamps.

Wall-clock time is read once and then advanced with `tokio::time::Instant`,
so timestamps stay monotonic and follow tokio's paused clock in tests.
*/
use chrono::Utc;
use std::sync::OnceLock;
use tokio::time::Instant;

static ANCHOR: OnceLock<(i64, Instant)> = OnceLock::new();

fn anchor() -> &'static (i64, Instant) {
    ANCHOR.get_or_init(|| (Utc::now().timestamp_millis(), Instant::now()))
}

/// Current time in milliseconds since the unix epoch
#[must_use]
pub fn now_millis() -> i64 {
    let (wall, start) = anchor();
    let now = Instant::now();
    // a paused runtime may sit behind the anchor taken by another runtime
    if now >= *start {
        wall.saturating_add(millis(now - *start))
    } else {
        wall.saturating_sub(millis(*start - now))
    }
}

fn millis(d: std::time::Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
