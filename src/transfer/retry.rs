//! Bounded exponential backoff for remote operations.

use backon::{ExponentialBuilder, Retryable as _};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::config::TransferSettings;
use crate::error::TransferError;

/// How often and how patiently a remote operation is attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            min_delay,
            max_delay: max_delay.max(min_delay),
        }
    }

    /// Policy for the session transport
    pub fn from_settings(settings: &TransferSettings) -> Self {
        Self::new(
            settings.retries,
            Duration::from_millis(settings.backoff_min_ms),
            Duration::from_millis(settings.backoff_max_ms),
        )
    }

    /// Policy for HTTP pulls
    pub fn http(settings: &TransferSettings) -> Self {
        Self::new(
            settings.http.retries,
            Duration::from_millis(settings.backoff_min_ms),
            Duration::from_millis(settings.backoff_max_ms),
        )
    }

    /// Single attempt, no backoff
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.attempts.saturating_sub(1) as usize)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is returned on exhaustion.
    pub async fn run<T, F, Fut>(&self, what: &str, op: F) -> Result<T, TransferError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
    {
        let tried = AtomicU32::new(0);
        let mut op = op;
        let counted = || {
            tried.fetch_add(1, Ordering::Relaxed);
            op()
        };
        let result = counted
            .retry(self.backoff())
            .when(|e: &TransferError| e.is_retryable())
            .notify(|e: &TransferError, delay: Duration| {
                tracing::debug!(
                    "{} failed attempt {} of {}, retrying in {:?}: {}",
                    what,
                    tried.load(Ordering::Relaxed),
                    self.attempts,
                    delay,
                    e
                );
            })
            .await;

        result.map_err(|e| {
            let attempts = tried.load(Ordering::Relaxed);
            if e.is_retryable() {
                tracing::warn!("{} failed after {} attempts: {}", what, attempts, e);
            }
            match e {
                TransferError::Connect {
                    server, message, ..
                } => TransferError::Connect {
                    server,
                    attempts,
                    message,
                },
                other => other,
            }
        })
    }
}
