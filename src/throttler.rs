//! Average-rate throttler shared by all sender threads.
//!
//! Threads charge the throttler with the bytes they are about to put on the
//! wire; `limit` sleeps just long enough to keep the aggregate rate at or
//! below the configured average.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

const MB_TO_BYTES: f64 = 1024.0 * 1024.0;
// Cap any single sleep so aborts are observed reasonably quickly.
const MAX_SLEEP_MS: u64 = 250;

pub struct Throttler {
    state: Mutex<ThrottlerState>,
    bytes_per_sec: f64,
}

struct ThrottlerState {
    start: Instant,
    total_bytes: i64,
}

impl Throttler {
    /// Returns `None` when the configured rate disables throttling.
    pub fn new(avg_mbytes_per_sec: f64) -> Option<Throttler> {
        if avg_mbytes_per_sec <= 0.0 {
            return None;
        }
        Some(Throttler {
            state: Mutex::new(ThrottlerState {
                start: Instant::now(),
                total_bytes: 0,
            }),
            bytes_per_sec: avg_mbytes_per_sec * MB_TO_BYTES,
        })
    }

    /// Charge `delta_bytes` against the budget, sleeping if the average rate
    /// would be exceeded. The sleep is sliced so a concurrent abort is not
    /// blocked behind a long pause.
    pub fn limit(&self, delta_bytes: i64) {
        let sleep_for = {
            let mut state = self.state.lock();
            state.total_bytes += delta_bytes;
            let expected_secs = state.total_bytes as f64 / self.bytes_per_sec;
            let elapsed_secs = state.start.elapsed().as_secs_f64();
            expected_secs - elapsed_secs
        };
        if sleep_for <= 0.0 {
            return;
        }
        let mut remaining_ms = (sleep_for * 1_000.0) as u64;
        while remaining_ms > 0 {
            let chunk = remaining_ms.min(MAX_SLEEP_MS);
            std::thread::sleep(Duration::from_millis(chunk));
            remaining_ms -= chunk;
        }
    }
}
