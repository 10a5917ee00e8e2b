use std::num::NonZeroU32;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

/// Global bandwidth cap shared by every worker of every download.
pub struct Throttle {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    burst: NonZeroU32,
}

impl Throttle {
    pub fn new(bytes_per_sec: NonZeroU32) -> Self {
        Self {
            limiter: RateLimiter::direct(Quota::per_second(bytes_per_sec)),
            burst: bytes_per_sec,
        }
    }

    /// Waits until `len` bytes may pass. Chunks bigger than the burst size
    /// are metered in pieces, since the limiter rejects those outright.
    pub async fn consume(&self, len: usize) {
        let mut remaining = u32::try_from(len).unwrap_or(u32::MAX);
        while let Some(step) = NonZeroU32::new(remaining.min(self.burst.get())) {
            // Cannot fail: step never exceeds the burst size.
            let _ = self.limiter.until_n_ready(step).await;
            remaining -= step.get();
        }
    }
}
