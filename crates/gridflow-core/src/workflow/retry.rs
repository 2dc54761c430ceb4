//! Per-call retry with exponential backoff and a per-attempt timeout.
//!
//! Retries apply to one external call (one cell), never to a whole step.
//! Transient errors and timeouts are retried until `max_attempts` is reached;
//! fatal errors stop immediately.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use gridflow_types::config::RetryConfig;
use gridflow_types::container::ItemErrorKind;

use crate::provider::analysis::AnalysisError;
use crate::provider::document::DocumentError;

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            multiplier: if config.backoff_multiplier.is_finite() && config.backoff_multiplier >= 1.0 {
                config.backoff_multiplier
            } else {
                1.0
            },
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Whether another attempt is allowed after `attempt` (1-based) failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let millis = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Retrying a call
// ---------------------------------------------------------------------------

/// Errors that know whether retrying can help.
pub trait Retryable: Display {
    fn is_transient(&self) -> bool;
}

impl Retryable for AnalysisError {
    fn is_transient(&self) -> bool {
        AnalysisError::is_transient(self)
    }
}

impl Retryable for DocumentError {
    fn is_transient(&self) -> bool {
        DocumentError::is_transient(self)
    }
}

/// Final failure of a retried call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallFailure {
    pub kind: ItemErrorKind,
    pub message: String,
    pub attempts: u32,
}

/// Run `op` until it succeeds, fails fatally, or runs out of attempts.
/// Each attempt is bounded by `timeout`.
pub async fn call_with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    timeout: Duration,
    mut op: F,
) -> Result<T, CallFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let (kind, message) = match tokio::time::timeout(timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) if !err.is_transient() => {
                return Err(CallFailure {
                    kind: ItemErrorKind::Fatal,
                    message: err.to_string(),
                    attempts: attempt,
                });
            }
            Ok(Err(err)) => (ItemErrorKind::Transient, err.to_string()),
            Err(_) => (
                ItemErrorKind::Timeout,
                format!("call timed out after {}ms", timeout.as_millis()),
            ),
        };

        if !policy.should_retry(attempt) {
            return Err(CallFailure {
                kind,
                message,
                attempts: attempt,
            });
        }

        let delay = policy.backoff_for(attempt);
        tracing::debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %message,
            "retrying external call"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_should_retry_within_limit() {
        let policy = fast_policy(3);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(350));
    }

    #[test]
    fn test_from_config_sanitizes_values() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            max_attempts: 0,
            initial_backoff_ms: 10,
            backoff_multiplier: f64::NAN,
            max_backoff_ms: 100,
        });
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.multiplier, 1.0);
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let calls = AtomicU32::new(0);
        let result = call_with_retry(&fast_policy(3), Duration::from_secs(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(AnalysisError::Transient("busy".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = call_with_retry(&fast_policy(5), Duration::from_secs(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AnalysisError::Fatal("bad request".into())) }
        })
        .await;
        let failure = result.unwrap_err();
        assert_eq!(failure.kind, ItemErrorKind::Fatal);
        assert_eq!(failure.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_transient_reports_attempts() {
        let result: Result<(), _> = call_with_retry(&fast_policy(2), Duration::from_secs(1), || async {
            Err(DocumentError::Unavailable("offline".into()))
        })
        .await;
        let failure = result.unwrap_err();
        assert_eq!(failure.kind, ItemErrorKind::Transient);
        assert_eq!(failure.attempts, 2);
        assert!(failure.message.contains("offline"));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_retryable() {
        let result: Result<(), AnalysisError> = Ok(());
        let failure = call_with_retry(&fast_policy(2), Duration::from_millis(10), || async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            result.clone()
        })
        .await
        .unwrap_err();
        assert_eq!(failure.kind, ItemErrorKind::Timeout);
        assert_eq!(failure.attempts, 2);
    }
}
