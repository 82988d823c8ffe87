//! Throttle ledger: enforces minimum spacing between operations on a
//! named resource (an external service or a target channel).
//!
//! Each key maps to the timestamp of its last scheduled dispatch. A
//! caller that arrives too early sleeps for the remaining difference.
//! The wait-then-stamp step is serialized per key: the deadline is
//! computed and recorded under the lock, so a second near-simultaneous
//! caller always observes the first caller's reservation and queues
//! behind it instead of firing after the same single wait.

use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::debug;

/// Per-key last-dispatch timestamps. Entries are created lazily on first
/// use and never removed during the process lifetime.
pub struct ThrottleLedger {
    last_dispatch: Mutex<HashMap<String, Instant>>,
}

impl ThrottleLedger {
    pub fn new() -> Self {
        Self {
            last_dispatch: Mutex::new(HashMap::new()),
        }
    }

    /// Sleep until at least `min_interval` has passed since the last
    /// dispatch recorded for `key`, then record the new dispatch time.
    ///
    /// Pure scheduling, no error conditions. The sleep happens outside
    /// the lock; the key is stamped with the scheduled dispatch time
    /// before sleeping, so concurrent callers on the same key serialize.
    pub async fn wait_if_needed(&self, key: &str, min_interval: Duration) {
        let deadline = {
            let mut map = self.last_dispatch.lock().await;
            let now = Instant::now();
            let deadline = match map.get(key) {
                Some(last) => {
                    let earliest = *last + min_interval;
                    if earliest > now { earliest } else { now }
                }
                None => now,
            };
            map.insert(key.to_string(), deadline);
            deadline
        };

        let wait = deadline.saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            debug!(
                key = %key,
                wait_secs = wait.as_secs_f64(),
                "throttling to respect min interval"
            );
            sleep_until(deadline).await;
        }
    }
}
