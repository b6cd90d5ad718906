//! Retry schedule for transient peer failures.

use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;

/// Ceiling on a single retry delay, in seconds.
pub const MAX_DELAY: u64 = 600;
/// Recommended ceiling for peer-facing requests, in seconds.
pub const PEER_MAX_DELAY: u64 = 300;

/// Cyclic delay schedule: `1, min(2^2, max), min(2^3, max), …` for `retries`
/// values, then the cycle starts over.
///
/// `delays(5, 15)` yields `1, 4, 8, 15, 15, 1, 4, 8, 15, 15, 1, …`.
pub fn delays(retries: usize, max_delay: u64) -> impl Iterator<Item = Duration> {
    assert!(retries > 0, "delay schedule requires at least one retry");
    let cycle: Vec<u64> = std::iter::once(1)
        .chain((2..=retries as u32).map(move |n| 2u64.saturating_pow(n).min(max_delay)))
        .collect();
    cycle.into_iter().cycle().map(Duration::from_secs)
}

/// Run `op`, retrying transient failures up to `retries` times under the
/// [`delays`] schedule, with an optional per-attempt timeout. Non-transient
/// errors surface immediately.
pub async fn retry_if_failed<T, F, Fut>(
    mut op: F,
    retries: usize,
    max_delay: u64,
    timeout: Option<Duration>,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delays = delays(retries.max(1), max_delay);
    let mut remaining = retries;
    loop {
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, op()).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout),
            },
            None => op().await,
        };
        match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && remaining > 0 => {
                remaining -= 1;
                let delay = delays.next().unwrap();
                tracing::warn!(
                    error = %err,
                    delay_secs = delay.as_secs(),
                    remaining,
                    "transient peer failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn delay_schedule_cycles() {
        let observed: Vec<u64> = delays(5, 15).take(11).map(|d| d.as_secs()).collect();
        assert_eq!(observed, vec![1, 4, 8, 15, 15, 1, 4, 8, 15, 15, 1]);
    }

    #[test]
    fn delay_schedule_caps_at_max() {
        let observed: Vec<u64> = delays(10, 300).take(10).map(|d| d.as_secs()).collect();
        assert_eq!(observed, vec![1, 4, 8, 16, 32, 64, 128, 256, 300, 300]);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors() {
        let attempts = AtomicUsize::new(0);
        let result = retry_if_failed(
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(Error::Network("connection reset".to_string()))
                    } else {
                        Ok(n)
                    }
                }
            },
            10,
            MAX_DELAY,
            None,
        )
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn fatal_errors_surface_immediately() {
        let attempts = AtomicUsize::new(0);
        let result: Result<()> = retry_if_failed(
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(Error::Http {
                        status: 404,
                        message: "missing".to_string(),
                    })
                }
            },
            10,
            MAX_DELAY,
            None,
        )
        .await;
        assert!(matches!(result, Err(Error::Http { status: 404, .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_the_error() {
        let result: Result<()> = retry_if_failed(
            || async { Err(Error::Timeout) },
            2,
            MAX_DELAY,
            None,
        )
        .await;
        assert!(matches!(result, Err(Error::Timeout)));
    }
}
