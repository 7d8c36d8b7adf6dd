use std::time::Duration;
use tokio::time::sleep;

/// Bounded retry cadence shared by the session bootstrap scan and the
/// per-product confirmation poll.
///
/// `delay` separates ordinary attempts; `error_delay` is used instead when
/// the previous attempt failed at the transport level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
    error_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            error_delay: delay,
        }
    }

    pub fn with_error_delay(mut self, error_delay: Duration) -> Self {
        self.error_delay = error_delay;
        self
    }

    /// Zero-delay policy, handy for tests.
    #[allow(dead_code)]
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn error_delay(&self) -> Duration {
        self.error_delay
    }

    /// 1-based attempt numbers.
    pub fn attempts(&self) -> impl Iterator<Item = u32> + use<> {
        1..=self.max_attempts
    }

    pub fn is_last(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    pub async fn pause(&self) {
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
    }

    pub async fn pause_after_error(&self) {
        if !self.error_delay.is_zero() {
            sleep(self.error_delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempts_are_one_based_and_bounded() {
        let policy = RetryPolicy::immediate(3);
        assert_eq!(policy.attempts().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(!policy.is_last(2));
        assert!(policy.is_last(3));
    }

    #[test]
    fn zero_attempts_yield_nothing() {
        let policy = RetryPolicy::immediate(0);
        assert_eq!(policy.attempts().count(), 0);
    }

    #[test]
    fn error_delay_defaults_to_delay() {
        let policy = RetryPolicy::new(2, Duration::from_millis(250));
        assert_eq!(policy.error_delay(), Duration::from_millis(250));
        let policy = policy.with_error_delay(Duration::from_millis(10));
        assert_eq!(policy.delay(), Duration::from_millis(250));
        assert_eq!(policy.error_delay(), Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_waits_for_configured_delay() {
        let policy = RetryPolicy::new(1, Duration::from_secs(2));
        let started = tokio::time::Instant::now();
        policy.pause().await;
        assert!(started.elapsed() >= Duration::from_secs(2));
    }
}
