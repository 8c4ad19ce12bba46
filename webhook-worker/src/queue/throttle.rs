//! Byte-rate ceiling for delivered payloads.
//!
//! RabbitMQ only bounds the number of unacknowledged messages, so the byte
//! ceiling is enforced on the consumer side: the consume loop charges each
//! payload before dispatching it, which stalls further pulls from the broker
//! while the budget is exhausted.

use std::time::Duration;

use tokio::time::{sleep, Instant};

/// Token bucket refilled at `rate` bytes per second, holding at most one
/// second worth of budget.
#[derive(Debug)]
pub struct ByteThrottle {
    rate: u64,
    available: f64,
    last_refill: Instant,
}

impl ByteThrottle {
    /// Create a throttle; a rate of zero disables throttling.
    pub fn new(rate: u64) -> Self {
        Self {
            rate,
            available: rate as f64,
            last_refill: Instant::now(),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate == 0
    }

    /// Wait until `bytes` may be dispatched, then charge them.
    ///
    /// A payload larger than the bucket waits for a full bucket and leaves
    /// the balance negative, delaying whatever comes next.
    pub async fn acquire(&mut self, bytes: usize) {
        if self.is_unlimited() {
            return;
        }

        self.refill();

        let capacity = self.rate as f64;
        let wanted = (bytes as f64).min(capacity);
        if self.available < wanted {
            let wait = Duration::from_secs_f64((wanted - self.available) / capacity);
            sleep(wait).await;
            self.refill();
        }

        self.available -= bytes as f64;
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.available = (self.available + elapsed * self.rate as f64).min(self.rate as f64);
    }
}
