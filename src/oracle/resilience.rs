//! Resilience envelope: retry with backoff, timeouts and circuit breaking.
//!
//! Callers compose the three layers as breaker -> retry -> timeout -> call:
//! one logical invocation may retry several times, each attempt bounded by
//! the request timeout, and invocation-level failures accumulate in the
//! breaker across separate requests.

use crate::oracle::circuit_breaker::CircuitBreaker;
use crate::oracle::error::{OracleError, OracleResult};
use crate::oracle::storage::{InMemoryStore, StateStore};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_retry::RetryIf;
use tracing::{debug, instrument, warn};

/// Upper bound for a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Delay before retry number `attempt` (zero-based): `base * 2^attempt`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    base.saturating_mul(factor).min(MAX_BACKOFF)
}

/// Retry/timeout/breaker wrapper shared by every upstream-facing call.
pub struct ResilienceEnvelope {
    breaker: Arc<CircuitBreaker>,
    attempts: Arc<dyn StateStore<u32>>,
    max_retries: u32,
    base_delay: Duration,
    request_timeout: Duration,
}

impl ResilienceEnvelope {
    pub fn new(
        breaker: Arc<CircuitBreaker>,
        max_retries: u32,
        base_delay: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            breaker,
            attempts: Arc::new(InMemoryStore::new()),
            max_retries,
            base_delay,
            request_timeout,
        }
    }

    /// Retry `op` on retryable errors with exponential backoff.
    ///
    /// Failed attempts are counted per `operation_id`; the count is cleared
    /// when the operation eventually succeeds.
    #[instrument(skip(self, op), fields(operation = %operation_id))]
    pub async fn with_retry<T, F, Fut>(
        &self,
        operation_id: &str,
        max_retries: u32,
        mut op: F,
    ) -> OracleResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = OracleResult<T>>,
    {
        let base = self.base_delay;
        let strategy = (0..max_retries).map(move |attempt| backoff_delay(base, attempt));
        let attempts = self.attempts.clone();

        let action = || {
            let attempt = op();
            let attempts = attempts.clone();
            async move {
                let result = attempt.await;
                if result.is_err() {
                    attempts
                        .modify(operation_id, &mut |slot: &mut Option<u32>| {
                            *slot = Some(slot.unwrap_or(0) + 1);
                        })
                        .await;
                }
                result
            }
        };

        let condition = |err: &OracleError| {
            let retry = err.is_retryable();
            if retry {
                debug!("Retryable failure in {}: {}", operation_id, err);
            }
            retry
        };

        let result = RetryIf::start(strategy, action, condition).await;
        match &result {
            Ok(_) => {
                self.attempts
                    .modify(operation_id, &mut |slot: &mut Option<u32>| *slot = None)
                    .await;
            }
            Err(err) => {
                warn!("Giving up on {} after retries: {}", operation_id, err);
            }
        }
        result
    }

    /// Bound `fut` by `timeout`.
    ///
    /// On expiry the inner future is dropped, which cancels the in-flight
    /// request instead of leaving it running in the background.
    pub async fn with_timeout<T, Fut>(
        &self,
        fut: Fut,
        timeout: Duration,
        operation: &str,
    ) -> OracleResult<T>
    where
        Fut: Future<Output = OracleResult<T>>,
    {
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!("{} timed out after {:?}", operation, timeout);
                Err(OracleError::Timeout {
                    operation: operation.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Run `op` behind the breaker for `service_id`.
    pub async fn with_circuit_breaker<T, F, Fut>(&self, service_id: &str, op: F) -> OracleResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = OracleResult<T>>,
    {
        self.breaker.call(service_id, op).await
    }

    /// Full envelope with the configured retry budget.
    pub async fn execute<T, F, Fut>(&self, service_id: &str, op: F) -> OracleResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = OracleResult<T>>,
    {
        self.execute_with_retries(service_id, self.max_retries, op).await
    }

    /// Breaker and timeout without retries, for non-idempotent calls.
    pub async fn execute_once<T, F, Fut>(&self, service_id: &str, op: F) -> OracleResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = OracleResult<T>>,
    {
        self.execute_with_retries(service_id, 0, op).await
    }

    /// Breaker and a caller-chosen timeout, without retries.
    pub async fn execute_once_within<T, F, Fut>(&self, service_id: &str, timeout: Duration, op: F) -> OracleResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = OracleResult<T>>,
    {
        self.compose(service_id, 0, timeout, op).await
    }

    /// Full envelope with an explicit retry budget.
    pub async fn execute_with_retries<T, F, Fut>(
        &self,
        service_id: &str,
        max_retries: u32,
        op: F,
    ) -> OracleResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = OracleResult<T>>,
    {
        self.compose(service_id, max_retries, self.request_timeout, op).await
    }

    #[instrument(skip(self, op), fields(service = %service_id))]
    async fn compose<T, F, Fut>(
        &self,
        service_id: &str,
        max_retries: u32,
        timeout: Duration,
        op: F,
    ) -> OracleResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = OracleResult<T>>,
    {
        let mut op = op;
        self.with_circuit_breaker(service_id, move || {
            self.with_retry(service_id, max_retries, move || {
                self.with_timeout(op(), timeout, service_id)
            })
        })
        .await
    }

    /// Failed attempts recorded for an operation since its last success.
    pub async fn attempts_for(&self, operation_id: &str) -> u32 {
        self.attempts.get(operation_id).await.unwrap_or(0)
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}
