//! Retry policy shared by every retrying call site: the task queue, the
//! forex settlement loop, staking position retries and the durable backend.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::SettlementError;

/// Decides whether a failure is worth another attempt.
pub type RetryPredicate = fn(&SettlementError) -> bool;

/// `{max_retries, initial_delay, factor}` with an optional ceiling.
///
/// The delay before retry `n` (1-based) is `initial_delay * factor^(n-1)`.
/// A factor of `1.0` gives a fixed delay. Without a predicate every error
/// is retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub factor: f64,
    pub max_delay: Option<Duration>,
    pub retry_if: Option<RetryPredicate>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), 2.0)
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration, factor: f64) -> Self {
        Self {
            max_retries,
            initial_delay,
            factor,
            max_delay: None,
            retry_if: None,
        }
    }

    /// Same delay before every retry.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self::new(max_retries, delay, 1.0)
    }

    pub fn no_retry() -> Self {
        Self::new(0, Duration::ZERO, 1.0)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn retry_if(mut self, predicate: RetryPredicate) -> Self {
        self.retry_if = Some(predicate);
        self
    }

    /// Retry only errors whose code is classified as transient.
    pub fn transient_only(self) -> Self {
        self.retry_if(SettlementError::is_retryable)
    }

    /// Whether `err` qualifies for a retry under this policy's predicate.
    pub fn retries_error(&self, err: &SettlementError) -> bool {
        self.retry_if.map_or(true, |predicate| predicate(err))
    }

    /// Delay before the given retry (1-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let cap = self.max_delay.unwrap_or(Duration::MAX);
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.factor.powi(exponent);
        if secs.is_nan() || secs <= 0.0 {
            return Duration::ZERO;
        }
        if secs >= cap.as_secs_f64() {
            return cap;
        }
        Duration::try_from_secs_f64(secs).unwrap_or(cap).min(cap)
    }

    /// Whether another attempt is allowed after `retries_done` retries.
    pub fn should_retry(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }

    /// Total attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Run `op` until it succeeds, fails with an error the policy does not
/// retry, or the policy is exhausted. `op` receives the 1-based attempt
/// number. Returns the last error.
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, label: &str, op: F) -> Result<T, SettlementError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, SettlementError>>,
{
    retry_until_cancelled(policy, label, &CancellationToken::new(), op).await
}

/// [`retry_with_backoff`] whose backoff sleeps end early when `token` is
/// cancelled. A cancelled wait returns the last error without another
/// attempt.
pub async fn retry_until_cancelled<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    token: &CancellationToken,
    mut op: F,
) -> Result<T, SettlementError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, SettlementError>>,
{
    let mut retries = 0;
    loop {
        let err = match op(retries + 1).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !policy.retries_error(&err) {
            tracing::debug!(operation = label, error = %err, "Permanent failure, not retrying");
            return Err(err);
        }
        if !policy.should_retry(retries) {
            return Err(err);
        }

        retries += 1;
        let delay = policy.delay_for_retry(retries);
        tracing::warn!(
            operation = label,
            attempt = retries,
            max_attempts = policy.max_attempts(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "Attempt failed, retrying"
        );
        tokio::select! {
            _ = token.cancelled() => {
                tracing::info!(operation = label, "Retry abandoned on shutdown");
                return Err(err);
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn gateway_down() -> SettlementError {
        SettlementError::external("gateway", "connection reset")
    }

    #[test]
    fn test_exponential_delays() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1000), 2.0);
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(4000));
        assert_eq!(policy.max_attempts(), 4);
    }

    #[test]
    fn test_fixed_and_capped() {
        let fixed = RetryPolicy::fixed(3, Duration::from_secs(5));
        assert_eq!(fixed.delay_for_retry(3), Duration::from_secs(5));

        let capped = RetryPolicy::new(10, Duration::from_secs(30), 2.0)
            .with_max_delay(Duration::from_secs(60));
        assert_eq!(capped.delay_for_retry(5), Duration::from_secs(60));
    }

    #[test]
    fn test_huge_delays_saturate_instead_of_panicking() {
        let policy = RetryPolicy::new(u32::MAX, Duration::from_secs(3600), 1e6);
        assert_eq!(policy.delay_for_retry(40), Duration::MAX);
        assert_eq!(policy.delay_for_retry(u32::MAX), Duration::MAX);

        let capped = policy.with_max_delay(Duration::from_secs(86_400));
        assert_eq!(capped.delay_for_retry(40), Duration::from_secs(86_400));
        assert_eq!(capped.max_attempts(), u32::MAX);
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::new(2, Duration::ZERO, 2.0);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
        assert!(!RetryPolicy::no_retry().should_retry(0));
    }

    #[test]
    fn test_transient_only_predicate() {
        let policy = RetryPolicy::default().transient_only();
        assert!(policy.retries_error(&gateway_down()));
        assert!(!policy.retries_error(&SettlementError::not_found("Wallet", "w-1")));
        assert!(RetryPolicy::default().retries_error(&SettlementError::not_found("Wallet", "w-1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_backoff_exhausts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_secs(1), 2.0);
        let start = tokio::time::Instant::now();

        let result: Result<(), SettlementError> = retry_with_backoff(&policy, "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(gateway_down()) }
        })
        .await;

        assert_eq!(result.unwrap_err().code(), ErrorCode::ExternalServiceError);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(start.elapsed() >= Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_backoff_recovers() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(5));
        let result = retry_with_backoff(&policy, "test", |attempt| async move {
            if attempt < 3 {
                Err(gateway_down())
            } else {
                Ok(attempt)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_tried_once() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(3, Duration::from_secs(5)).transient_only();
        let start = tokio::time::Instant::now();

        let result: Result<(), SettlementError> = retry_with_backoff(&policy, "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SettlementError::new(ErrorCode::WalletNotFound, "Wallet not found")) }
        })
        .await;

        assert_eq!(result.unwrap_err().code(), ErrorCode::WalletNotFound);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_returns_promptly() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(6 * 3600));
        let token = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let result: Result<(), SettlementError> = retry_until_cancelled(&policy, "test", &token, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(gateway_down()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
