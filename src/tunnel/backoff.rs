//! Reconnect delay policy: exponential growth from a base delay, capped.

use std::time::Duration;

use crate::config::TunnelConfig;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, multiplier: f64) -> Self {
        let base = base.min(max);
        Self {
            base,
            max,
            multiplier,
            current: base,
        }
    }

    pub fn from_config(config: &TunnelConfig) -> Self {
        Self::new(
            config.reconnect_delay,
            config.max_reconnect_delay,
            config.reconnect_multiplier,
        )
    }

    /// Delay to wait before the next attempt.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Return the current delay and grow it for the following failure.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let grown = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max);
        self.current = grown.min(self.max);
        delay
    }

    /// Back to the base delay after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}
