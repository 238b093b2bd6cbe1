//! Bounded local retry for transient backend failures.

use crate::errors::{MpuError, MpuResult};
use backon::{ExponentialBuilder, Retryable};
use std::{future::Future, time::Duration};

const INITIAL_BACKOFF: Duration = Duration::from_millis(25);
const MAX_BACKOFF: Duration = Duration::from_millis(400);

/// Retries an operation while it fails with a transient error.
///
/// Conflicts and validation errors are never transient, so they are returned
/// on the first attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
        }
    }

    #[cfg(test)]
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Doubling delays between attempts, capped at the maximum.
    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_max_times(self.attempts.saturating_sub(1) as usize)
    }

    pub async fn run<T, F, Fut>(&self, what: &str, op: F) -> MpuResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = MpuResult<T>>,
    {
        op.retry(self.backoff())
            .sleep(tokio::time::sleep)
            .when(MpuError::is_transient)
            .notify(|err: &MpuError, dur: Duration| {
                tracing::debug!(
                    backoff_ms = dur.as_millis() as u64,
                    "{} failed transiently: {}",
                    what,
                    err
                );
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backon::BackoffBuilder;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let value = RetryPolicy::immediate(3)
            .run("flaky", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(MpuError::ServiceUnavailable)
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_the_last_attempt() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = RetryPolicy::immediate(2)
            .run("down", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(MpuError::ServiceUnavailable)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MpuError::ServiceUnavailable));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn conflicts_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = RetryPolicy::immediate(5)
            .run("cas", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(MpuError::ConcurrentRequest("/a/stor/o".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MpuError::ConcurrentRequest(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let delays: Vec<_> = RetryPolicy::new(7).backoff().build().collect();
        let expected = [25, 50, 100, 200, 400, 400].map(Duration::from_millis);
        assert_eq!(delays, expected);
    }
}
