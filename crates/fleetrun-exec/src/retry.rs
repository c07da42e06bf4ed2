//! Retry policy shared by connection setup and reconnect polling

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Attempts made by [`RetryPolicy::connect`]
pub const CONNECT_ATTEMPTS: u32 = 4;

/// Delay between connection attempts
pub const CONNECT_DELAY: Duration = Duration::from_secs(10);

/// Delay between reconnect polls
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

/// Delay schedule between attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential {
        initial: Duration,
        max: Duration,
        factor: f64,
    },
}

impl Backoff {
    /// Delay after the given 1-based attempt
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential {
                initial,
                max,
                factor,
            } => {
                let exp = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
                let scaled = initial.as_secs_f64() * factor.powi(exp);
                if scaled.is_finite() && scaled < max.as_secs_f64() {
                    Duration::try_from_secs_f64(scaled.max(0.0)).unwrap_or(max)
                } else {
                    max
                }
            }
        }
    }
}

/// Why a retried operation gave up
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RetryError<E> {
    /// Every allowed attempt failed
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    /// The overall deadline passed
    #[error("deadline of {deadline:?} exceeded after {attempts} attempts")]
    DeadlineExceeded {
        deadline: Duration,
        attempts: u32,
        last: Option<E>,
    },

    /// The error was classified as not worth retrying
    #[error("non-retryable failure on attempt {attempts}: {last}")]
    Fatal { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    /// Number of attempts that were made
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::DeadlineExceeded { attempts, .. }
            | RetryError::Fatal { attempts, .. } => *attempts,
        }
    }

    /// The last underlying error, if an attempt completed
    pub fn into_last(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } | RetryError::Fatal { last, .. } => Some(last),
            RetryError::DeadlineExceeded { last, .. } => last,
        }
    }
}

/// Bounded retry with a delay schedule and an optional overall deadline
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempt bound, `None` for unbounded (a deadline should then be set)
    pub max_attempts: Option<u32>,
    pub backoff: Backoff,
    /// Overall bound measured from the first attempt
    pub deadline: Option<Duration>,
}

impl RetryPolicy {
    /// Fixed number of attempts with a fixed delay
    #[must_use]
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            backoff: Backoff::Fixed(delay),
            deadline: None,
        }
    }

    /// Connection establishment: 4 attempts, 10s apart
    #[must_use]
    pub fn connect() -> Self {
        Self::fixed(CONNECT_ATTEMPTS, CONNECT_DELAY)
    }

    /// Post-reboot reconnect: poll every 10s until `deadline`
    #[must_use]
    pub fn reconnect(deadline: Duration) -> Self {
        Self {
            max_attempts: None,
            backoff: Backoff::Fixed(RECONNECT_INTERVAL),
            deadline: Some(deadline),
        }
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Run `op` until it succeeds or the policy gives up.
    ///
    /// `op` receives the 1-based attempt number. `retryable` decides whether
    /// a failure is worth another attempt. An attempt still in flight when
    /// the deadline passes is abandoned.
    ///
    /// # Errors
    /// Returns `RetryError` describing why the policy gave up
    pub async fn run<T, E, F, Fut, C>(&self, mut op: F, retryable: C) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let start = Instant::now();
        let deadline_at = self.deadline.map(|d| start + d);
        let mut attempt = 0u32;
        let mut last = None;

        loop {
            attempt += 1;

            let outcome = match deadline_at {
                Some(at) => match tokio::time::timeout_at(at, op(attempt)).await {
                    Ok(outcome) => outcome,
                    Err(_) => return Err(self.deadline_exceeded(attempt, last)),
                },
                None => op(attempt).await,
            };

            let err = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !retryable(&err) {
                return Err(RetryError::Fatal {
                    attempts: attempt,
                    last: err,
                });
            }

            if self.max_attempts.is_some_and(|max| attempt >= max) {
                warn!(attempts = attempt, error = %err, "retry bound reached");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            let delay = self.backoff.delay(attempt);
            warn!(attempt, error = %err, delay = ?delay, "attempt failed, retrying");
            last = Some(err);

            if let Some(at) = deadline_at
                && Instant::now() + delay >= at
            {
                tokio::time::sleep_until(at).await;
                return Err(self.deadline_exceeded(attempt, last));
            }
            tokio::time::sleep(delay).await;
        }
    }

    fn deadline_exceeded<E>(&self, attempts: u32, last: Option<E>) -> RetryError<E> {
        RetryError::DeadlineExceeded {
            deadline: self.deadline.unwrap_or_default(),
            attempts,
            last,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::connect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_stops_at_bound() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::connect()
            .run(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>("inactive") }
                },
                |_| true,
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), CONNECT_ATTEMPTS);
        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: 4,
                last: "inactive"
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_midway() {
        let result = RetryPolicy::fixed(5, Duration::from_secs(1))
            .run(
                |attempt| async move {
                    if attempt < 3 {
                        Err("not yet")
                    } else {
                        Ok(attempt)
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(result, Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_stops_immediately() {
        let result: Result<(), _> = RetryPolicy::connect()
            .run(|_| async { Err("denied") }, |e| *e != "denied")
            .await;

        assert_eq!(result.unwrap_err().attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded() {
        let start = Instant::now();
        let result: Result<(), _> = RetryPolicy::reconnect(Duration::from_secs(60))
            .run(|_| async { Err("down") }, |_| true)
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::DeadlineExceeded { .. }));
        // attempts at 0, 10, ..., 50s; the next delay would cross 60s
        assert_eq!(err.attempts(), 6);
        assert_eq!(start.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_abandons_hung_attempt() {
        let result: Result<(), RetryError<&str>> = RetryPolicy::reconnect(Duration::from_secs(5))
            .run(
                |_| async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                },
                |_| true,
            )
            .await;

        assert!(matches!(
            result,
            Err(RetryError::DeadlineExceeded {
                attempts: 1,
                last: None,
                ..
            })
        ));
    }

    #[test]
    fn test_exponential_backoff_caps() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(10),
            factor: 2.0,
        };

        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(3), Duration::from_secs(4));
        assert_eq!(backoff.delay(10), Duration::from_secs(10));
    }

    #[test]
    fn test_negative_backoff_factor_clamps_to_zero() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(10),
            factor: -2.0,
        };

        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::ZERO);
        assert_eq!(backoff.delay(3), Duration::from_secs(4));
    }
}
