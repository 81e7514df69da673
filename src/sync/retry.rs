//! Bounded polling of asynchronous remote jobs.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

/// How often and how long to poll an upload artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    /// One poll per second for a minute.
    fn default() -> Self {
        Self {
            max_attempts: 60,
            interval: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Minimal delays for tests.
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_attempts: 3,
            interval: Duration::from_millis(1),
        }
    }

    /// Polls `operation` until it yields `Some`.
    ///
    /// Waits one interval before every attempt. Returns `Ok(None)` once
    /// `max_attempts` polls came back empty; errors end polling at once.
    pub async fn poll<F, Fut, T, E>(
        &self,
        operation_name: &str,
        mut operation: F,
    ) -> Result<Option<T>, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        for attempt in 1..=self.max_attempts {
            sleep(self.interval).await;
            if let Some(value) = operation().await? {
                debug!(operation = operation_name, attempt, "Poll completed");
                return Ok(Some(value));
            }
        }
        debug!(
            operation = operation_name,
            attempts = self.max_attempts,
            "Poll gave up"
        );
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_poll_returns_first_ready_value() {
        let calls = &AtomicU32::new(0);
        let result: Result<Option<u32>, String> = RetryPolicy::test()
            .poll("test", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok((n == 2).then_some(n))
            })
            .await;
        assert_eq!(result, Ok(Some(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_poll_gives_up_after_max_attempts() {
        let calls = &AtomicU32::new(0);
        let result: Result<Option<()>, String> = RetryPolicy::test()
            .poll("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
            .await;
        assert_eq!(result, Ok(None));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_stops_on_error() {
        let calls = &AtomicU32::new(0);
        let result: Result<Option<()>, String> = RetryPolicy::test()
            .poll("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("boom".to_string())
            })
            .await;
        assert_eq!(result, Err("boom".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
