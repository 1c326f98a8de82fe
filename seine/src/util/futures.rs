use std::fmt;
use std::future::Future;
use std::time::Duration;

use slog::{debug, trace, Logger};

use crate::util::backoff::ExponentialBackoff;

/// Generic helper for retrying async operations with exponential backoff.
/// Creates a [`RetryConfig`] that can be configured with a retry limit, a
/// per-attempt timeout, and when to start logging failed attempts.
///
/// The default is to retry forever with a 60 second timeout per attempt,
/// logging from the first failed attempt on.
pub fn retry(operation_name: impl Into<String>, logger: &Logger) -> RetryConfig {
    RetryConfig {
        operation_name: operation_name.into(),
        logger: logger.clone(),
        limit: None,
        log_after: 1,
        timeout: Some(Duration::from_secs(60)),
    }
}

pub struct RetryConfig {
    operation_name: String,
    logger: Logger,
    limit: Option<u64>,
    log_after: u64,
    timeout: Option<Duration>,
}

impl RetryConfig {
    /// Retry forever. This is deliberate for provider RPC calls: transient
    /// faults are expected and there is no useful fallback, so upstream
    /// cancellation comes from detaching the listener, not from giving up
    /// here.
    pub fn no_limit(mut self) -> Self {
        self.limit = None;
        self
    }

    /// Fail after `limit` failed attempts.
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Only log failed attempts from attempt number `log_after` on.
    pub fn log_after(mut self, log_after: u64) -> Self {
        self.log_after = log_after;
        self
    }

    /// Never log failed attempts.
    pub fn no_logging(mut self) -> Self {
        self.log_after = u64::MAX;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = Some(Duration::from_secs(secs));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn no_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    pub async fn run<F, Fut, I, E>(self, mut try_it: F) -> Result<I, TimeoutError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<I, E>> + Send,
        E: fmt::Display,
    {
        trace!(self.logger, "Run with retry: {}", self.operation_name);

        // Jittered so a flock of retriers spreads back out.
        let mut backoff =
            ExponentialBackoff::with_jitter(Duration::from_millis(2), Duration::from_secs(30));
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;

            let result = match self.timeout {
                Some(timeout) => match tokio::time::timeout(timeout, try_it()).await {
                    Ok(result) => result.map_err(TimeoutError::Inner),
                    Err(_) => Err(TimeoutError::Elapsed),
                },
                None => try_it().await.map_err(TimeoutError::Inner),
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if let Some(limit) = self.limit {
                if attempt >= limit {
                    return Err(error);
                }
            }

            if attempt >= self.log_after {
                match &error {
                    TimeoutError::Elapsed => debug!(
                        self.logger,
                        "Trying again after {} timed out (attempt #{})",
                        self.operation_name,
                        attempt + 1,
                    ),
                    TimeoutError::Inner(e) => debug!(
                        self.logger,
                        "Trying again after {} failed (attempt #{}): {}",
                        self.operation_name,
                        attempt + 1,
                        e,
                    ),
                }
            }

            backoff.sleep_async().await;
        }
    }
}

/// A failed attempt: either the operation's own error or the per-attempt
/// deadline elapsing.
#[derive(Debug)]
pub enum TimeoutError<E> {
    Inner(E),
    Elapsed,
}

impl<E> TimeoutError<E> {
    pub fn is_elapsed(&self) -> bool {
        matches!(self, TimeoutError::Elapsed)
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            TimeoutError::Inner(e) => Some(e),
            TimeoutError::Elapsed => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for TimeoutError<E> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TimeoutError::Inner(e) => e.fmt(f),
            TimeoutError::Elapsed => write!(f, "operation took too long"),
        }
    }
}

impl<E: fmt::Display + fmt::Debug> std::error::Error for TimeoutError<E> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use crate::log::discard;

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let attempts = Arc::new(AtomicU64::new(0));
        let counter = attempts.clone();

        let result: Result<u64, TimeoutError<anyhow::Error>> = retry("flaky op", &discard())
            .no_limit()
            .no_logging()
            .run(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(anyhow::anyhow!("transient"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_at_the_limit() {
        let attempts = Arc::new(AtomicU64::new(0));
        let counter = attempts.clone();

        let result: Result<u64, TimeoutError<anyhow::Error>> = retry("doomed op", &discard())
            .limit(3)
            .no_logging()
            .run(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow::anyhow!("permanent"))
                }
            })
            .await;

        assert!(!result.unwrap_err().is_elapsed());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn slow_attempts_elapse() {
        let result: Result<(), TimeoutError<anyhow::Error>> = retry("slow op", &discard())
            .limit(1)
            .no_logging()
            .timeout(Duration::from_millis(10))
            .run(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(result.unwrap_err().is_elapsed());
    }
}
