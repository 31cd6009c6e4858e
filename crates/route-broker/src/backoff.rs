use std::time::Duration;

/// Linear reconnect backoff with a ceiling and an attempt cap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub step: Duration,
    pub max_delay: Duration,
    /// Consecutive failed connects before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            step: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 10_000,
        }
    }
}

impl ReconnectPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sleep before the next attempt after `failures` consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        self.step.saturating_mul(failures).min(self.max_delay)
    }

    /// True once `failures` consecutive connects have used up the cap.
    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }
}
