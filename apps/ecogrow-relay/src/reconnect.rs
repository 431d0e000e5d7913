use std::time::Duration;

use rand::Rng;

/// Exponential backoff with optional jitter for client reconnect loops.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            multiplier: 2.0,
            jitter: 0.2,
            attempt: 0,
        }
    }

    /// Fraction of each delay (0.0..=1.0) that is randomised.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_delay(&mut self) -> Duration {
        let exp = self.multiplier.powi(self.attempt.min(32) as i32);
        let base = (self.initial.as_secs_f64() * exp).min(self.max.as_secs_f64());
        self.attempt = self.attempt.saturating_add(1);

        let delay = if self.jitter > 0.0 {
            let spread = base * self.jitter;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            (base + offset).clamp(0.0, self.max.as_secs_f64())
        } else {
            base
        };
        Duration::from_nanos((delay * 1e9).round() as u64)
    }

    /// Call after a connection has been established.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
