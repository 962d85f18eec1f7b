//! Bounded retry policy with exponential backoff.

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_delay: Duration::from_millis(2000),
            backoff: 1.5,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff.powi(attempt as i32);
        let millis = (self.initial_delay.as_millis() as f64) * factor;
        Duration::from_millis(millis.min(self.max_delay.as_millis() as f64) as u64)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn backoff_progression() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(2000));
        assert_eq!(policy.delay(1), Duration::from_millis(3000));
        assert_eq!(policy.delay(2), Duration::from_millis(4500));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(20), Duration::from_secs(10));
    }
}
