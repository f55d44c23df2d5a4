//! Polling delay that grows while nothing happens.
//!
//! The delay follows a logistic curve from `initial` to `max` over
//! `max_iter` idle rounds, so the first few empty polls stay quick and the
//! interval then settles near `max`.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AdaptiveClock {
    initial: Duration,
    max: Duration,
    max_iter: u32,
    iteration: u32,
}

impl AdaptiveClock {
    pub fn new(initial: Duration, max: Duration, max_iter: u32) -> Self {
        Self {
            initial,
            max: max.max(initial),
            max_iter: max_iter.max(1),
            iteration: 0,
        }
    }

    /// Delay after `n` consecutive idle rounds.
    pub fn delay(&self, n: u32) -> Duration {
        let span = self.max - self.initial;
        self.initial + span.mul_f64(progress(n, self.max_iter))
    }

    /// Delay for the current round; advances the idle counter.
    pub fn tick(&mut self) -> Duration {
        let delay = self.delay(self.iteration);
        self.iteration = (self.iteration + 1).min(self.max_iter);
        delay
    }

    /// Work was found: poll quickly again.
    pub fn reset(&mut self) {
        self.iteration = 0;
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }
}

/// Logistic curve scaled so that `progress(0) == 0` and
/// `progress(max_iter) == 1`.
fn progress(n: u32, max_iter: u32) -> f64 {
    if n >= max_iter {
        return 1.0;
    }
    let width = max_iter as f64;
    // Unscaled curve reaches 1% and 99% at both ends
    let k = 2.0 * 99f64.ln() / width;
    let raw = |x: f64| 1.0 / (1.0 + (-k * (x - width / 2.0)).exp());
    let (low, high) = (raw(0.0), raw(width));
    ((raw(n as f64) - low) / (high - low)).clamp(0.0, 1.0)
}
