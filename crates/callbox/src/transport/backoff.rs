use std::time::Duration;

/// Exponential reconnect delay: `min(base * decay^attempts, max)`, rounded to
/// whole milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: Duration,
    decay: f64,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, decay: f64, max: Duration) -> Self {
        let decay = if decay.is_finite() && decay >= 1.0 {
            decay
        } else {
            1.0
        };
        Self { base, decay, max }
    }

    pub fn delay(&self, attempts: u32) -> Duration {
        let max_ms = self.max.as_millis() as f64;
        let exponent = attempts.min(i32::MAX as u32) as i32;
        let raw = self.base.as_millis() as f64 * self.decay.powi(exponent);
        let ms = if raw.is_finite() { raw.min(max_ms) } else { max_ms };
        Duration::from_millis(ms.round() as u64)
    }
}
