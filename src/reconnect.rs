//! Reconnect and timeout utilities.
//!
//! The session worker waits a fixed delay between reconnect attempts. There is
//! no backoff growth; an optional cap bounds consecutive failed attempts.

use std::future::Future;
use std::time::Duration;

/// Policy controlling automatic reconnects after an unexpected close.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before every reconnect attempt.
    pub delay: Duration,
    /// Consecutive failed attempts tolerated before giving up.
    ///
    /// `None` retries until the caller disconnects. `Some(0)` disables
    /// automatic reconnects entirely.
    pub max_attempts: Option<usize>,
}

impl ReconnectPolicy {
    /// Fixed delay, unbounded retries.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }

    /// Never reconnects automatically.
    pub fn disabled() -> Self {
        Self {
            delay: Duration::ZERO,
            max_attempts: Some(0),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Returns whether another attempt may be scheduled after
    /// `failed_attempts` consecutive failures.
    pub fn allows(&self, failed_attempts: usize) -> bool {
        self.max_attempts
            .map_or(true, |max_attempts| failed_attempts < max_attempts)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(3))
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

/// Like [`with_timeout`], but `None` waits indefinitely.
pub async fn with_optional_timeout<T, Fut>(
    timeout: Option<Duration>,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    match timeout {
        Some(timeout) => with_timeout(timeout, future).await,
        None => Ok(future.await),
    }
}
