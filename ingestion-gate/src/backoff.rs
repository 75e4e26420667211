use std::time::Duration;

/// Exponential backoff between attempts of the same operation.
///
/// - initial_delay: wait after the first failed attempt
/// - multiplier: growth factor per further attempt (> 1.0)
/// - max_delay: cap for any single wait
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub const fn new(initial_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            multiplier,
            max_delay,
        }
    }

    /// No waiting at all, for tests that exercise retry counts.
    pub const fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (0-based).
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        // Clamp in f64, large finite products still overflow a Duration
        match Duration::try_from_secs_f64(secs) {
            Ok(scaled) => scaled.min(self.max_delay),
            Err(_) => self.max_delay,
        }
    }
}

/// A bounded number of attempts with backoff in between.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_progression_and_cap() {
        let p = BackoffPolicy::new(Duration::from_millis(100), 2.0, Duration::from_secs(1));

        let cases = vec![
            (0, 100),
            (1, 200),
            (2, 400),
            (3, 800),
            (4, 1000), // 1600 capped
            (30, 1000),
            (u32::MAX, 1000),
        ];

        for (attempt, expected_ms) in cases {
            let d = p.next_delay(attempt);
            assert_eq!(d.as_millis(), expected_ms, "attempt {attempt}");
        }
    }

    #[test]
    fn test_long_retry_runs_stay_capped() {
        let p = BackoffPolicy::new(Duration::from_millis(200), 2.0, Duration::from_secs(10));

        for attempt in 60..=1000 {
            assert_eq!(p.next_delay(attempt), Duration::from_secs(10), "attempt {attempt}");
        }
    }

    #[test]
    fn test_immediate_never_waits() {
        let p = BackoffPolicy::immediate();
        assert_eq!(p.next_delay(0), Duration::ZERO);
        assert_eq!(p.next_delay(10), Duration::ZERO);
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        let p = RetryPolicy::new(0, BackoffPolicy::immediate());
        assert_eq!(p.attempts(), 1);
    }
}
