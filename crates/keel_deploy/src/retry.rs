//! Bounded exponential backoff for network calls.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use keel_chain::NetworkError;
use keel_core::KeelConfig;

use crate::events::{DeployObserver, ProgressEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per operation, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Deadline applied to each read-only call.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &KeelConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms.max(config.initial_backoff_ms)),
            call_timeout: config.call_timeout(),
        }
    }

    /// Delay after failed attempt number `attempt` (1-based): doubles from
    /// `initial_backoff`, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

/// The last error of an operation that gave up, and how many attempts it took.
#[derive(Debug, Clone)]
pub struct RetryFailure {
    pub error: NetworkError,
    pub attempts: u32,
}

pub(crate) async fn with_timeout<T, Fut>(timeout: Duration, fut: Fut) -> Result<T, NetworkError>
where
    Fut: Future<Output = Result<T, NetworkError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(NetworkError::Timeout(timeout)),
    }
}

/// Run a read-only call under the policy's timeout, retrying transient
/// failures.
pub(crate) async fn retry_read<T, F, Fut>(
    policy: &RetryPolicy,
    observer: &dyn DeployObserver,
    operation: &str,
    mut op: F,
) -> Result<T, RetryFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, NetworkError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match with_timeout(policy.call_timeout, op()).await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                debug!(operation, attempt, error = %error, "read failed, backing off");
                observer.on_event(&ProgressEvent::Retrying {
                    operation: operation.to_string(),
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                    error: error.to_string(),
                });
                tokio::time::sleep(delay).await;
            }
            Err(error) => {
                return Err(RetryFailure {
                    error,
                    attempts: attempt,
                });
            }
        }
    }
}
