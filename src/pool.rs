//! Concurrency limiter: fixed-size permit pools for each operation
//! class (external fetch, remote edit).
//!
//! Pool sizes are small integers fixed at startup; they exist to
//! respect the unstated concurrent-connection ceilings of both the
//! scraped sites and the remote API. A permit bounds operations that
//! are actively in flight, not operations queued behind a throttle.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

/// A named pool of permits. Cloneable handle; all clones share permits.
#[derive(Clone)]
pub struct SlotPool {
    name: &'static str,
    semaphore: Arc<Semaphore>,
}

impl SlotPool {
    pub fn new(name: &'static str, size: usize) -> Self {
        Self {
            name,
            semaphore: Arc::new(Semaphore::new(size)),
        }
    }

    /// Wait for a free permit. The returned guard releases the permit on
    /// drop, on every exit path including cancellation.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .expect("slot pool semaphore is never closed");
        trace!(pool = self.name, "slot acquired");
        permit
    }
}
