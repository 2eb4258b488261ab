//! Bounded retry with exponential backoff and jitter.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RetryConfig;
use crate::diagnose::DiagnoseError;
use crate::notify::NotifyError;
use crate::storage::UpdateError;
use crate::telemetry::TelemetryError;

/// Errors that may succeed when simply tried again.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for TelemetryError {
    fn is_transient(&self) -> bool {
        TelemetryError::is_transient(self)
    }
}

/// Only a request that never reached the capability is retried in place. A
/// timed-out call may already have been billed, so the signature goes back to
/// `NEW` and is picked up again by a later tick under a fresh reservation.
impl Transient for DiagnoseError {
    fn is_transient(&self) -> bool {
        matches!(self, DiagnoseError::Unavailable(_))
    }
}

impl Transient for NotifyError {
    fn is_transient(&self) -> bool {
        match self {
            NotifyError::Unreachable(_) => true,
            NotifyError::Status(status) => *status >= 500,
        }
    }
}

/// A busy or briefly unavailable database is worth another try; a rejected
/// transition is not.
impl Transient for UpdateError {
    fn is_transient(&self) -> bool {
        matches!(self, UpdateError::Store(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, jitter: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.jitter,
        )
    }

    /// One attempt, no retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO, 0.0)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Un-jittered delay after failed attempt `attempt` (1-based):
    /// `base * 2^(attempt-1)`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// [`backoff`](Self::backoff) spread by up to `±jitter` of itself.
    pub fn delay(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        if self.jitter == 0.0 || backoff.is_zero() {
            return backoff;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        backoff.mul_f64(1.0 + spread)
    }

    /// Run `op` until it succeeds, fails permanently, runs out of attempts,
    /// or `token` is cancelled. The last error is returned.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, token: &CancellationToken, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + Display,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts && !token.is_cancelled() => {
                    let delay = self.delay(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::select! {
                        _ = token.cancelled() => return Err(e),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(4), 0.0)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(1000), 0.0);
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_millis(1000));
        assert_eq!(policy.backoff(60), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1000), Duration::from_secs(60), 0.2);
        for _ in 0..100 {
            let d = policy.delay(1);
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1200), "{d:?}");
        }
    }

    #[test]
    fn test_only_unbilled_diagnosis_failures_are_transient() {
        assert!(DiagnoseError::Unavailable("refused".into()).is_transient());
        assert!(!DiagnoseError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!DiagnoseError::Parse("eof".into()).is_transient());
    }

    #[test]
    fn test_notify_server_errors_are_transient() {
        assert!(NotifyError::Unreachable("refused".into()).is_transient());
        assert!(NotifyError::Status(502).is_transient());
        assert!(!NotifyError::Status(404).is_transient());
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<u32, TelemetryError> = fast(3)
            .run("fetch", &CancellationToken::new(), move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(TelemetryError::Unreachable("connection refused".into()))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), TelemetryError> = fast(3)
            .run("fetch", &CancellationToken::new(), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TelemetryError::Timeout(Duration::from_secs(1)))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), TelemetryError> = fast(5)
            .run("fetch", &CancellationToken::new(), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TelemetryError::Decode("unexpected EOF".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_retrying() {
        let token = CancellationToken::new();
        token.cancel();
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let _: Result<(), TelemetryError> = fast(5)
            .run("fetch", &token, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TelemetryError::Unreachable("down".into()))
            })
            .await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
