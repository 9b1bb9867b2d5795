//! Fixed-interval retries.
//!
//! Waits against eventually consistent external state (agents reaching goal state, backup
//! configurations changing their status) poll a fixed number of times with a constant pause in
//! between. There is no backoff, no jitter and no cancellation: a wait runs until it succeeds or
//! its attempts are used up.

use std::{future::Future, time::Duration};

use snafu::Snafu;

/// The outcome of a single attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Attempt<T> {
    /// The awaited state was reached.
    Done(T),

    /// The awaited state was not reached yet, try again after the interval.
    Retry { reason: String },
}

#[derive(Debug, Snafu)]
pub enum Error<E: std::error::Error + 'static> {
    #[snafu(display("gave up after {attempts} attempts: {reason}"))]
    Exhausted { attempts: usize, reason: String },

    #[snafu(display("attempt failed with a non-retryable error"))]
    Aborted { source: E },
}

/// How many attempts to make, and how long to sleep in between.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetrySettings {
    pub attempts: usize,
    pub interval: Duration,
}

impl RetrySettings {
    pub const fn new(attempts: usize, interval: Duration) -> Self {
        Self { attempts, interval }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self::new(30, Duration::from_secs(3))
    }
}

/// Runs `f` until it returns [`Attempt::Done`] or `settings.attempts` attempts were made.
///
/// Errors returned by `f` abort the loop immediately.
pub async fn do_and_retry<T, E, F, Fut>(settings: RetrySettings, mut f: F) -> Result<T, Error<E>>
where
    E: std::error::Error + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Attempt<T>, E>>,
{
    let mut reason = String::from("no attempt was made");

    for attempt in 1..=settings.attempts {
        match f().await {
            Ok(Attempt::Done(value)) => return Ok(value),
            Ok(Attempt::Retry { reason: retry_reason }) => {
                tracing::debug!(
                    attempt,
                    attempts = settings.attempts,
                    reason = %retry_reason,
                    "condition not met yet"
                );
                reason = retry_reason;
            }
            Err(source) => return Err(Error::Aborted { source }),
        }

        if attempt < settings.attempts {
            tokio::time::sleep(settings.interval).await;
        }
    }

    ExhaustedSnafu {
        attempts: settings.attempts,
        reason,
    }
    .fail()
}

#[cfg(test)]
mod tests {
    use std::{
        fmt,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[derive(Debug)]
    struct Broken;

    impl fmt::Display for Broken {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("broken")
        }
    }

    impl std::error::Error for Broken {}

    const FAST: RetrySettings = RetrySettings::new(5, Duration::from_millis(1));

    #[tokio::test]
    async fn returns_once_done() {
        let calls = &AtomicUsize::new(0);
        let result: Result<_, Error<Broken>> = do_and_retry(FAST, move || async move {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == 3 {
                Ok(Attempt::Done(call))
            } else {
                Ok(Attempt::Retry {
                    reason: format!("call {call}"),
                })
            }
        })
        .await;

        assert_eq!(result.expect("third call succeeds"), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_attempts() {
        let calls = &AtomicUsize::new(0);
        let result: Result<(), Error<Broken>> = do_and_retry(FAST, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Attempt::Retry {
                reason: "agents are not ready".to_owned(),
            })
        })
        .await;

        assert!(matches!(
            result,
            Err(Error::Exhausted { attempts: 5, ref reason }) if reason == "agents are not ready"
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn aborts_on_error() {
        let calls = &AtomicUsize::new(0);
        let result: Result<(), Error<Broken>> = do_and_retry(FAST, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Broken)
        })
        .await;

        assert!(matches!(result, Err(Error::Aborted { source: Broken })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
