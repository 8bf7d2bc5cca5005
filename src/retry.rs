//! Retry utilities for transient failure recovery.
//!
//! Provides blocking exponential backoff for operations that may fail
//! transiently, such as opening the libvirt connection while libvirtd is
//! still starting.

use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Standard exponential backoff multiplier.
const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Initial delay for hypervisor connection attempts.
const CONNECTION_INITIAL_DELAY_MS: u64 = 200;

/// Maximum delay between hypervisor connection attempts.
const CONNECTION_MAX_DELAY_SECS: u64 = 2;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the initial attempt).
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries (caps exponential growth).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (typically 2.0).
    pub backoff_multiplier: f64,
    /// Give up once this much time has passed since the first attempt.
    pub max_elapsed: Option<Duration>,
}

impl RetryConfig {
    /// Config for opening the hypervisor connection: keep trying until
    /// `timeout` has elapsed.
    pub fn for_connection(timeout: Duration) -> Self {
        Self {
            max_attempts: u32::MAX,
            initial_delay: Duration::from_millis(CONNECTION_INITIAL_DELAY_MS),
            max_delay: Duration::from_secs(CONNECTION_MAX_DELAY_SECS),
            backoff_multiplier: BACKOFF_MULTIPLIER,
            max_elapsed: Some(timeout),
        }
    }
}

/// Execute an operation with retry logic.
///
/// The `should_retry` function determines whether a given error is transient
/// and worth retrying.
pub fn retry_with_backoff<T, E, F, R>(
    config: RetryConfig,
    operation_name: &str,
    mut operation: F,
    should_retry: R,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let started = Instant::now();
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation() {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        operation = %operation_name,
                        attempts = attempt,
                        "operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                let out_of_time = config
                    .max_elapsed
                    .is_some_and(|limit| started.elapsed() + delay > limit);

                if attempt >= config.max_attempts || out_of_time {
                    warn!(
                        operation = %operation_name,
                        attempts = attempt,
                        error = %e,
                        "operation failed after max attempts"
                    );
                    return Err(e);
                }

                if !should_retry(&e) {
                    debug!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "operation failed with non-retryable error"
                    );
                    return Err(e);
                }

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    delay_ms = delay.as_millis(),
                    error = %e,
                    "operation failed, will retry"
                );

                thread::sleep(delay);

                // Exponential backoff with cap
                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_multiplier: BACKOFF_MULTIPLIER,
            max_elapsed: None,
        }
    }

    #[test]
    fn test_succeeds_after_transient_failures() {
        let calls = Cell::new(0);
        let result: Result<u32, String> = retry_with_backoff(
            fast(5),
            "flaky",
            || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err("not yet".to_string())
                } else {
                    Ok(7)
                }
            },
            |_| true,
        );
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_stops_at_max_attempts() {
        let calls = Cell::new(0);
        let result: Result<(), String> = retry_with_backoff(
            fast(3),
            "always failing",
            || {
                calls.set(calls.get() + 1);
                Err("down".to_string())
            },
            |_| true,
        );
        assert!(result.is_err());
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_non_retryable_error_returns_immediately() {
        let calls = Cell::new(0);
        let result: Result<(), String> = retry_with_backoff(
            fast(10),
            "fatal",
            || {
                calls.set(calls.get() + 1);
                Err("bad uri".to_string())
            },
            |_| false,
        );
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_elapsed_limit() {
        let config = RetryConfig {
            max_elapsed: Some(Duration::from_millis(20)),
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(5),
            ..fast(u32::MAX)
        };
        let started = Instant::now();
        let result: Result<(), String> =
            retry_with_backoff(config, "deadline", || Err("down".to_string()), |_| true);
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
