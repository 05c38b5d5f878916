//! Retry wrapper for port mapping clients
//!
//! Gateways drop packets and time out now and then. [`RetryAdapter`] wraps any
//! [`PortMappingClient`] and repeats each failed operation with exponential
//! backoff, reporting every failed attempt to an observer before retrying.

use super::client::PortMappingClient;
use super::types::{MappingError, MappingRequest};
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub retries: u32,
    /// Delay before the first retry
    pub min_delay: Duration,
    /// Growth factor between consecutive delays
    pub factor: u32,
    /// Upper bound for a single delay
    pub max_delay: Option<Duration>,
}

impl RetryPolicy {
    /// Retry without waiting between attempts
    pub fn immediate(retries: u32) -> Self {
        Self {
            retries,
            min_delay: Duration::ZERO,
            factor: 1,
            max_delay: None,
        }
    }

    /// Total number of attempts including the first one
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Backoff schedule yielding one delay per retry
    pub fn backoff(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_factor(self.factor.max(1) as f32)
            .with_max_times(self.retries as usize);

        match self.max_delay {
            Some(max) => builder.with_max_delay(max),
            None => builder.without_max_delay(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 10,
            min_delay: Duration::from_secs(1),
            factor: 2,
            max_delay: None,
        }
    }
}

/// Details of a failed attempt handed to the failure observer
#[derive(Debug)]
pub struct FailedAttempt<'a> {
    /// Client operation that failed (`map`, `destroy` or `external_ip`)
    pub operation: &'static str,
    /// 1-based attempt number
    pub attempt_number: u32,
    /// Attempts still available after this one
    pub retries_left: u32,
    /// The error returned by the attempt
    pub error: &'a MappingError,
}

/// Callback invoked on every failed attempt
pub type FailureObserver = Arc<dyn Fn(&FailedAttempt<'_>) + Send + Sync>;

/// Observer that logs failed attempts
pub fn log_failed_attempt(attempt: &FailedAttempt<'_>) {
    warn!(
        "Port mapping {} attempt {} failed ({} retries left): {}",
        attempt.operation, attempt.attempt_number, attempt.retries_left, attempt.error
    );
}

/// [`PortMappingClient`] that retries every operation of the wrapped client
pub struct RetryAdapter<C> {
    inner: C,
    policy: RetryPolicy,
    observer: FailureObserver,
}

impl<C: PortMappingClient> RetryAdapter<C> {
    /// Wrap a client with the given policy, logging failed attempts
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            observer: Arc::new(log_failed_attempt),
        }
    }

    /// Replace the failure observer
    pub fn with_observer(mut self, observer: FailureObserver) -> Self {
        self.observer = observer;
        self
    }

    /// The wrapped client
    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Run `op` until it succeeds, fails permanently or the budget is spent
    async fn retry<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T, MappingError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, MappingError>>,
    {
        let max_attempts = self.policy.max_attempts();
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;
        let observer = &self.observer;

        let attempt = move || {
            let attempt_number = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let fut = op();
            async move {
                let result = fut.await;
                if let Err(error) = &result {
                    observer(&FailedAttempt {
                        operation,
                        attempt_number,
                        retries_left: max_attempts.saturating_sub(attempt_number),
                        error,
                    });
                }
                result
            }
        };

        attempt
            .retry(self.policy.backoff())
            .sleep(tokio::time::sleep)
            .when(MappingError::is_retryable)
            .notify(|error: &MappingError, delay: Duration| {
                debug!("Retrying {} in {:?} after: {}", operation, delay, error);
            })
            .await
    }
}

#[async_trait]
impl<C: PortMappingClient> PortMappingClient for RetryAdapter<C> {
    async fn map(&self, request: MappingRequest) -> Result<(), MappingError> {
        self.retry("map", || self.inner.map(request)).await
    }

    async fn destroy(&self) -> Result<(), MappingError> {
        self.retry("destroy", || self.inner.destroy()).await
    }

    async fn external_ip(&self) -> Result<IpAddr, MappingError> {
        self.retry("external_ip", || self.inner.external_ip()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backon::BackoffBuilder;

    fn schedule(policy: RetryPolicy) -> Vec<Duration> {
        policy.backoff().build().collect()
    }

    #[test]
    fn test_default_policy_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 11);

        let delays = schedule(policy);
        assert_eq!(delays.len(), 10);
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[1], Duration::from_secs(2));
        assert_eq!(delays[3], Duration::from_secs(8));
        assert_eq!(delays[9], Duration::from_secs(512));
    }

    #[test]
    fn test_policy_delay_cap() {
        let policy = RetryPolicy {
            max_delay: Some(Duration::from_secs(5)),
            ..RetryPolicy::default()
        };
        let delays = schedule(policy);
        assert_eq!(delays[2], Duration::from_secs(4));
        assert_eq!(delays[3], Duration::from_secs(5));
        assert_eq!(delays[9], Duration::from_secs(5));
    }

    #[test]
    fn test_immediate_policy() {
        let policy = RetryPolicy::immediate(3);
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(schedule(policy), vec![Duration::ZERO; 3]);
    }
}
