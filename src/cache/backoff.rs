use rand::Rng;
use std::time::Duration;

/// Jittered exponential reconnect delay.
///
/// Each delay is the previous one multiplied by a random factor in `[1, 2)`
/// until it reaches half the cap; from then on the cap is used.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        let base = base.min(cap);
        Self {
            base,
            cap,
            current: base,
        }
    }

    /// Delay to wait now; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let jitter = rand::thread_rng().gen::<f64>();
        self.next_delay_with(jitter)
    }

    /// Same as [`next_delay`](Self::next_delay) with an explicit jitter in
    /// `[0, 1)`.
    pub fn next_delay_with(&mut self, jitter: f64) -> Duration {
        let delay = self.current;
        self.current = if delay < self.cap / 2 {
            delay.mul_f64(1.0 + jitter.clamp(0.0, 1.0)).min(self.cap)
        } else {
            self.cap
        };
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}
