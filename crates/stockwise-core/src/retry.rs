use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same pause after every failed attempt.
    Fixed,
    /// Pause grows with the attempt number (`attempt * base_delay`).
    Linear,
}

/// Bounded retry budget shared by the source and destination connection paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: delay,
            backoff: Backoff::Fixed,
        }
    }

    pub fn linear(max_attempts: usize, pause: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: pause,
            backoff: Backoff::Linear,
        }
    }

    /// Pause to wait after the 1-based `attempt` failed.
    pub fn delay_after_attempt(&self, attempt: usize) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Linear => {
                let factor = u32::try_from(attempt.max(1)).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        }
    }

    pub fn with_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::linear(3, Duration::from_millis(500))
    }
}
