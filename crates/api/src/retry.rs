//! Fixed-delay retry with a caller-supplied retry predicate.

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ConstantBuilder, Retryable};

/// Outcome of [`fixed_delay`]: the final result plus how many times the operation was re-run.
#[derive(Debug)]
pub struct Retried<T, E> {
    pub result: Result<T, E>,
    pub retries: u32,
}

/// Run `op` up to `attempts` times, sleeping `delay` between tries, as long as
/// `should_retry` accepts the error. Errors it rejects end the loop immediately.
pub async fn fixed_delay<T, E, F, Fut, P>(attempts: u32, delay: Duration, op: F, should_retry: P) -> Retried<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
{
    let retries = AtomicU32::new(0);
    let backoff = ConstantBuilder::default()
        .with_delay(delay)
        .with_max_times(attempts.saturating_sub(1) as usize);
    let result = op
        .retry(backoff)
        .sleep(tokio::time::sleep)
        .when(should_retry)
        .notify(|_, _| {
            retries.fetch_add(1, Ordering::Relaxed);
        })
        .await;
    Retried { result, retries: retries.into_inner() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum Failure {
        Flaky,
        Gone,
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_attempt_after_two_retries() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let t0 = tokio::time::Instant::now();
        let out = fixed_delay(
            3,
            Duration::from_secs(1),
            move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 { Err(Failure::Flaky) } else { Ok("ok") }
            },
            |e| *e != Failure::Gone,
        )
        .await;
        assert_eq!(out.result, Ok("ok"));
        assert_eq!(out.retries, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(t0.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_surfaces_last_error() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out: Retried<(), Failure> = fixed_delay(
            3,
            Duration::from_secs(1),
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Failure::Flaky)
            },
            |e| *e != Failure::Gone,
        )
        .await;
        assert_eq!(out.result, Err(Failure::Flaky));
        assert_eq!(out.retries, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rejected_error_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let t0 = std::time::Instant::now();
        let out: Retried<(), Failure> = fixed_delay(
            3,
            Duration::from_secs(1),
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Failure::Gone)
            },
            |e| *e != Failure::Gone,
        )
        .await;
        assert_eq!(out.result, Err(Failure::Gone));
        assert_eq!(out.retries, 0);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(t0.elapsed() < Duration::from_millis(500));
    }
}
