//! Reconnection policy for attaching to a socket target.
//!
//! Fixed delay between attempts, no backoff, no jitter. Every retry is a fresh
//! connection with the same arguments.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            delay: Duration::from_secs(1),
        }
    }
}

/// Outcome of [`RetryPolicy::run`] when no attempt succeeded.
#[derive(Debug)]
pub enum RetryExhausted<E> {
    /// The last attempt failed and no retries remain.
    Failed { attempts: u32, error: E },
    /// The token was cancelled while waiting between attempts.
    Cancelled { attempts: u32 },
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Run `attempt` until it succeeds, the policy is exhausted, or `cancel` fires.
    ///
    /// `attempt` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> Result<T, RetryExhausted<E>>
    where
        E: std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut n = 1;
        loop {
            let error = match attempt(n).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if n >= self.max_attempts() {
                return Err(RetryExhausted::Failed { attempts: n, error });
            }

            tracing::warn!(
                attempt = n,
                max_attempts = self.max_attempts(),
                delay_ms = self.delay.as_millis() as u64,
                error = %error,
                "Attempt failed, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(attempt = n, "Retry cancelled");
                    return Err(RetryExhausted::Cancelled { attempts: n });
                }
                _ = tokio::time::sleep(self.delay) => {}
            }
            n += 1;
        }
    }
}
