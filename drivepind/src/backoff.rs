use rand::Rng;
use std::time::Duration;

pub const RECONNECT_BASE: Duration = Duration::from_millis(250);
pub const RECONNECT_MAX: Duration = Duration::from_secs(10);

/// Jittered exponential backoff between reconnection attempts.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self {
            base,
            max,
            jitter,
            attempt: 0,
        }
    }

    pub fn reconnect() -> Self {
        Self::new(RECONNECT_BASE, RECONNECT_MAX, true)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt. Each call doubles the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let mut rng = rand::thread_rng();
        self.next_delay_with_rng(&mut rng)
    }

    pub fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let delay = self.delay_with_rng(self.attempt, rng);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Call once a connection is established.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = attempt.min(16);
        let exp = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        let delay_ms = if self.jitter {
            rng.gen_range(0..=exp)
        } else {
            exp
        };
        Duration::from_millis(delay_ms)
    }
}
