use std::time::Duration;

/// Facilitate sleeping with an exponential backoff. Delays double from
/// `base` up to `ceiling`. A backoff built with `with_jitter` scales every
/// sleep by a random factor in `[0.5, 1.0)` so simultaneous retriers do not
/// thunder back in lockstep.
pub struct ExponentialBackoff {
    pub attempt: u64,
    base: Duration,
    ceiling: Duration,
    jitter: bool,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        ExponentialBackoff {
            attempt: 0,
            base,
            ceiling,
            jitter: false,
        }
    }

    pub fn with_jitter(base: Duration, ceiling: Duration) -> Self {
        ExponentialBackoff {
            jitter: true,
            ..Self::new(base, ceiling)
        }
    }

    /// Record that we made an attempt and sleep for the appropriate amount
    /// of time.
    pub async fn sleep_async(&mut self) {
        tokio::time::sleep(self.next_attempt()).await
    }

    /// The full (unjittered) delay of the current attempt.
    pub fn delay(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(31) as u32);
        self.base.saturating_mul(factor).min(self.ceiling)
    }

    fn next_attempt(&mut self) -> Duration {
        let mut delay = self.delay();
        if self.jitter {
            delay = delay.mul_f64(0.5 + rand::random::<f64>() / 2.0);
        }
        self.attempt += 1;
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
