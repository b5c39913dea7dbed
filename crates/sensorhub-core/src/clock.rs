//! Process-wide monotonic clock used to stamp samples.

use std::sync::OnceLock;
use std::time::Instant;

static ORIGIN: OnceLock<Instant> = OnceLock::new();

/// Microseconds elapsed since the first call in this process.
///
/// Monotonic and unaffected by wall-clock changes, so readers can compute
/// sample spacing without worrying about NTP steps.
pub fn monotonic_us() -> u64 {
    let origin = ORIGIN.get_or_init(Instant::now);
    u64::try_from(origin.elapsed().as_micros()).unwrap_or(u64::MAX)
}
