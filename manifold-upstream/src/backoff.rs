//! Reconnect delay schedule

use rand::Rng;
use std::time::Duration;

use manifold_config::UpstreamDefaults;

/// Exponential backoff schedule with bounded jitter
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    initial: Duration,
    multiplier: f64,
    max: Duration,
    jitter: Duration,
    max_attempts: u32,
}

impl BackoffSchedule {
    pub fn new(defaults: &UpstreamDefaults) -> Self {
        Self {
            initial: defaults.backoff_initial,
            multiplier: defaults.backoff_multiplier,
            max: defaults.backoff_max,
            jitter: defaults.backoff_jitter,
            max_attempts: defaults.max_reconnect_attempts,
        }
    }

    /// Attempts allowed before the connector settles in the error state
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Deterministic part of the delay for attempt `n` (1-based)
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let factor = self.multiplier.powi(exponent as i32);
        let delay = self.initial.mul_f64(factor);
        delay.min(self.max)
    }

    /// Delay for attempt `n`, jitter included
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter.is_zero() {
            Duration::ZERO
        } else {
            let micros = rand::rng().random_range(0..=self.jitter.as_micros() as u64);
            Duration::from_micros(micros)
        };
        self.base_delay(attempt) + jitter
    }
}
