//! Bounded exponential backoff with jitter, shared by every component that
//! talks to an external service (the source tracker, the sink, the sink's
//! directory lookup).

use log::{debug, warn};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Whether a failure is worth retrying at all.
pub trait Transience {
    fn is_transient(&self) -> bool;
}

const BASE_DELAY: Duration = Duration::from_millis(250);
const MAX_DELAY: Duration = Duration::from_secs(8);

/// Retries `attempt` up to `max_retries` additional times (so `max_retries + 1`
/// calls total) when the returned error is transient, backing off
/// exponentially with jitter between attempts. A non-transient error, or
/// exhausting the retry budget, is returned to the caller unchanged.
pub async fn retry_with_backoff<T, E, F, Fut>(
    max_retries: u32,
    mut attempt: F,
) -> Result<T, E>
where
    E: Transience,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut tries = 0;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) if tries < max_retries && err.is_transient() => {
                let delay = backoff_delay(tries);
                warn!(
                    "transient error on attempt {}, retrying in {:?}",
                    tries + 1,
                    delay
                );
                tokio::time::sleep(delay).await;
                tries += 1;
            }
            Err(err) => {
                debug!("giving up after {tries} attempt(s)");
                return Err(err);
            }
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = BASE_DELAY.saturating_mul(1 << attempt.min(5));
    let capped = exp.min(MAX_DELAY);
    let jitter_frac: f64 = rand::rng().random_range(0.5..1.5);
    capped.mul_f64(jitter_frac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Transient;
    impl Transience for Transient {
        fn is_transient(&self) -> bool {
            true
        }
    }

    #[derive(Debug)]
    struct Fatal;
    impl Transience for Fatal {
        fn is_transient(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let mut calls = 0;
        let result: Result<i32, Transient> = retry_with_backoff(3, || {
            calls += 1;
            async move {
                if calls < 3 {
                    Err(Transient)
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget_exhausted() {
        let mut calls = 0;
        let result: Result<i32, Transient> = retry_with_backoff(2, || {
            calls += 1;
            async move { Err(Transient) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let mut calls = 0;
        let result: Result<i32, Fatal> = retry_with_backoff(3, || {
            calls += 1;
            async move { Err(Fatal) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
