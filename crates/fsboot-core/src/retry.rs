use crate::action::ActionFailure;
use crate::concurrency::{interruptible_sleep, shutdown_requested};
use fsboot_config::Settings;
use std::time::Duration;
use tracing::{debug, warn};

/// Bounded attempts with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.max_retries, settings.retry_delay())
    }

    /// Delay slept after the `attempt`-th failure (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor)
    }
}

/// Run `action` under `policy`, sleeping between attempts.
///
/// The closure receives the 1-based attempt number. Fatal failures end the
/// loop immediately; transient ones are retried until attempts run out.
/// A shutdown request ends the loop after the current attempt.
pub fn retry<T>(
    policy: &RetryPolicy,
    label: &str,
    action: impl FnMut(u32) -> Result<T, ActionFailure>,
) -> Result<T, ActionFailure> {
    retry_with(
        policy,
        label,
        |delay| {
            interruptible_sleep(delay);
            !shutdown_requested()
        },
        action,
    )
}

/// Like [`retry`], with the backoff supplied by the caller. `sleep` returns
/// `false` to stop retrying; the last failure is then returned as is.
pub fn retry_with<T>(
    policy: &RetryPolicy,
    label: &str,
    mut sleep: impl FnMut(Duration) -> bool,
    mut action: impl FnMut(u32) -> Result<T, ActionFailure>,
) -> Result<T, ActionFailure> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        debug!("{label}: attempt {attempt}/{max_attempts}");
        match action(attempt) {
            Ok(value) => return Ok(value),
            Err(failure) if !failure.is_retryable() => {
                warn!("{label}: {failure}, not retrying");
                return Err(failure.with_attempts(attempt));
            }
            Err(failure) if attempt >= max_attempts => {
                warn!("{label}: giving up after {attempt} attempts: {failure}");
                return Err(failure.with_attempts(attempt));
            }
            Err(failure) => {
                let delay = policy.delay_after(attempt);
                warn!(
                    "{label}: attempt {attempt}/{max_attempts} failed ({failure}), retrying in {}s",
                    delay.as_secs()
                );
                if !sleep(delay) {
                    warn!("{label}: shutdown requested, abandoning after {attempt} attempts");
                    return Err(failure.with_attempts(attempt));
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_failing_action_runs_max_attempts_with_doubling_delays() {
        let policy = RetryPolicy::new(3, Duration::from_secs(10));
        let mut calls = 0;
        let mut slept = Vec::new();

        let result: Result<(), _> = retry_with(
            &policy,
            "discovery",
            |d| {
                slept.push(d);
                true
            },
            |_| {
                calls += 1;
                Err(ActionFailure::transient(4, "no portal"))
            },
        );

        let failure = result.unwrap_err();
        assert_eq!(calls, 3);
        assert_eq!(failure.attempts, 3);
        assert_eq!(failure.exit_code, 4);
        assert_eq!(
            slept,
            vec![Duration::from_secs(10), Duration::from_secs(20)]
        );
    }

    #[test]
    fn returns_first_success() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1));
        let mut slept = Vec::new();
        let value = retry_with(
            &policy,
            "apt",
            |d| {
                slept.push(d);
                true
            },
            |attempt| {
                if attempt < 3 {
                    Err(ActionFailure::transient(100, "lock held"))
                } else {
                    Ok(attempt)
                }
            },
        )
        .unwrap();
        assert_eq!(value, 3);
        assert_eq!(slept.len(), 2);
    }

    #[test]
    fn fatal_failure_is_not_retried() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        let mut calls = 0;
        let result: Result<(), _> = retry_with(
            &policy,
            "cache",
            |_| panic!("must not sleep"),
            |_| {
                calls += 1;
                Err(ActionFailure::fatal(1, "device missing"))
            },
        );
        assert_eq!(calls, 1);
        assert_eq!(result.unwrap_err().attempts, 1);
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        let policy = RetryPolicy::new(0, Duration::ZERO);
        let mut calls = 0;
        let _: Result<(), _> = retry_with(
            &policy,
            "x",
            |_| true,
            |_| {
                calls += 1;
                Err(ActionFailure::transient(1, "nope"))
            },
        );
        assert_eq!(calls, 1);
    }

    #[test]
    fn interrupted_backoff_stops_further_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_secs(5));
        let mut calls = 0;
        let mut slept = Vec::new();
        let result: Result<(), _> = retry_with(
            &policy,
            "network",
            |d| {
                slept.push(d);
                false
            },
            |_| {
                calls += 1;
                Err(ActionFailure::transient(3, "no carrier"))
            },
        );

        let failure = result.unwrap_err();
        assert_eq!(calls, 1);
        assert_eq!(failure.attempts, 1);
        assert_eq!(failure.exit_code, 3);
        assert_eq!(slept, vec![Duration::from_secs(5)]);
    }

    #[test]
    fn delay_after_saturates() {
        let policy = RetryPolicy::new(100, Duration::from_secs(10));
        assert_eq!(policy.delay_after(1), Duration::from_secs(10));
        assert_eq!(policy.delay_after(3), Duration::from_secs(40));
        assert!(policy.delay_after(64) >= Duration::from_secs(10));
    }
}
