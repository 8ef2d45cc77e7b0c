//! Circuit breaker for upstream service health tracking.
//!
//! Each logical service id (`prediction_fee`, `prediction_fraud`,
//! `transfer_submission`, ...) has its own breaker state. After too many
//! consecutive failures the breaker opens and rejects calls immediately; once
//! the reset timeout has elapsed exactly one trial call is let through, and
//! its outcome decides whether the breaker closes or opens again.

use crate::oracle::error::{ErrorClass, OracleError, OracleResult};
use crate::oracle::storage::{InMemoryStore, StateStore};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Breaker position for a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected until the reset timeout elapses
    Open,
    /// One trial call is allowed to test the service
    HalfOpen,
}

/// Health tracking for one service.
#[derive(Debug, Clone)]
pub struct CircuitState {
    pub service_id: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<Instant>,
    /// When the current half-open trial was admitted
    pub trial_started_at: Option<Instant>,
}

impl CircuitState {
    fn new(service_id: &str) -> Self {
        Self {
            service_id: service_id.to_string(),
            state: BreakerState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            trial_started_at: None,
        }
    }

    /// Open and still inside the reset window.
    pub fn is_open(&self, reset_timeout: Duration) -> bool {
        self.state == BreakerState::Open
            && self
                .last_failure_at
                .map(|at| at.elapsed() < reset_timeout)
                .unwrap_or(false)
    }
}

/// How a call was admitted through the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed, regular call
    Normal,
    /// Single trial call while half-open
    Trial,
}

/// Per-service circuit breaker.
pub struct CircuitBreaker {
    store: Arc<dyn StateStore<CircuitState>>,
    failure_threshold: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self::with_store(Arc::new(InMemoryStore::new()), failure_threshold, reset_timeout)
    }

    pub fn with_store(
        store: Arc<dyn StateStore<CircuitState>>,
        failure_threshold: u32,
        reset_timeout: Duration,
    ) -> Self {
        Self {
            store,
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
        }
    }

    /// Decide whether a call to `service` may proceed.
    #[instrument(skip(self), fields(service = %service))]
    pub async fn acquire(&self, service: &str) -> OracleResult<Admission> {
        let now = Instant::now();
        let reset_timeout = self.reset_timeout;
        let mut admission = Err(OracleError::CircuitOpen {
            service: service.to_string(),
        });

        self.store
            .modify(service, &mut |slot: &mut Option<CircuitState>| {
                let state = slot.get_or_insert_with(|| CircuitState::new(service));
                admission = match state.state {
                    BreakerState::Closed => Ok(Admission::Normal),
                    BreakerState::Open => {
                        let cooled = state
                            .last_failure_at
                            .map(|at| now.duration_since(at) >= reset_timeout)
                            .unwrap_or(true);
                        if cooled {
                            state.state = BreakerState::HalfOpen;
                            state.trial_started_at = Some(now);
                            Ok(Admission::Trial)
                        } else {
                            Err(OracleError::CircuitOpen {
                                service: state.service_id.clone(),
                            })
                        }
                    }
                    BreakerState::HalfOpen => {
                        // A trial whose caller vanished must not wedge the breaker.
                        let abandoned = state
                            .trial_started_at
                            .map(|at| now.duration_since(at) >= reset_timeout)
                            .unwrap_or(true);
                        if abandoned {
                            state.trial_started_at = Some(now);
                            Ok(Admission::Trial)
                        } else {
                            Err(OracleError::CircuitOpen {
                                service: state.service_id.clone(),
                            })
                        }
                    }
                };
            })
            .await;

        match &admission {
            Ok(Admission::Trial) => info!("Circuit for {} half-open, admitting trial call", service),
            Ok(Admission::Normal) => {}
            Err(_) => debug!("Circuit for {} open, rejecting call", service),
        }
        admission
    }

    /// Record a successful call; closes the breaker and clears the failure count.
    #[instrument(skip(self), fields(service = %service))]
    pub async fn record_success(&self, service: &str) {
        let mut was_half_open = false;
        self.store
            .modify(service, &mut |slot: &mut Option<CircuitState>| {
                let state = slot.get_or_insert_with(|| CircuitState::new(service));
                was_half_open = state.state == BreakerState::HalfOpen;
                state.state = BreakerState::Closed;
                state.consecutive_failures = 0;
                state.trial_started_at = None;
            })
            .await;

        if was_half_open {
            info!("Circuit for {} closed after successful trial", service);
        }
    }

    /// Record a failed call; opens the breaker at the threshold or after a failed trial.
    #[instrument(skip(self), fields(service = %service))]
    pub async fn record_failure(&self, service: &str) {
        let now = Instant::now();
        let threshold = self.failure_threshold;
        let mut failures = 0;
        let mut opened = false;

        self.store
            .modify(service, &mut |slot: &mut Option<CircuitState>| {
                let state = slot.get_or_insert_with(|| CircuitState::new(service));
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                state.last_failure_at = Some(now);
                state.trial_started_at = None;
                if state.state == BreakerState::HalfOpen || state.consecutive_failures >= threshold {
                    opened = state.state != BreakerState::Open;
                    state.state = BreakerState::Open;
                }
                failures = state.consecutive_failures;
            })
            .await;

        if opened {
            warn!("Circuit for {} opened after {} consecutive failures", service, failures);
        } else {
            debug!("Recorded failure for {}: {} consecutive failures", service, failures);
        }
    }

    /// Hand an undecided trial back so the next caller can run one.
    #[instrument(skip(self), fields(service = %service))]
    pub async fn release_trial(&self, service: &str) {
        self.store
            .modify(service, &mut |slot: &mut Option<CircuitState>| {
                let state = slot.get_or_insert_with(|| CircuitState::new(service));
                if state.state == BreakerState::HalfOpen {
                    state.trial_started_at = None;
                }
            })
            .await;
        debug!("Released trial for {} without a verdict", service);
    }

    /// Run `op` behind the breaker for `service`.
    ///
    /// Client errors (bad input) do not count against the service, and never
    /// close it from half-open.
    pub async fn call<T, F, Fut>(&self, service: &str, op: F) -> OracleResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = OracleResult<T>>,
    {
        let admission = self.acquire(service).await?;

        match op().await {
            Ok(value) => {
                self.record_success(service).await;
                Ok(value)
            }
            Err(err) => {
                if err.classify() == ErrorClass::ClientError {
                    // Bad input says nothing about the service, so a trial stays undecided.
                    match admission {
                        Admission::Trial => self.release_trial(service).await,
                        Admission::Normal => self.record_success(service).await,
                    }
                } else {
                    self.record_failure(service).await;
                }
                Err(err)
            }
        }
    }

    /// Current state for a service (closed and clean when never seen).
    pub async fn snapshot(&self, service: &str) -> CircuitState {
        self.store
            .get(service)
            .await
            .unwrap_or_else(|| CircuitState::new(service))
    }

    /// Whether calls to `service` are currently being rejected.
    pub async fn is_open(&self, service: &str) -> bool {
        self.snapshot(service).await.is_open(self.reset_timeout)
    }

    /// Force a service back to the closed state.
    pub async fn reset(&self, service: &str) {
        self.store.put(service, CircuitState::new(service)).await;
        debug!("Reset circuit for {}", service);
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn reset_timeout(&self) -> Duration {
        self.reset_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn failing() -> OracleError {
        OracleError::UpstreamUnavailable {
            service: "inference".to_string(),
            message: "connection reset".to_string(),
            status: None,
        }
    }

    async fn fail_n(cb: &CircuitBreaker, service: &str, n: u32) {
        for _ in 0..n {
            let _ = cb.call(service, || async { Err::<(), _>(failing()) }).await;
        }
    }

    #[tokio::test]
    async fn test_initially_closed() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(60));
        let state = cb.snapshot("prediction_fee").await;

        assert_eq!(state.state, BreakerState::Closed);
        assert_eq!(state.consecutive_failures, 0);
        assert!(!cb.is_open("prediction_fee").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trips_after_threshold_and_short_circuits() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(60));
        fail_n(&cb, "prediction_fee", 3).await;
        assert!(cb.is_open("prediction_fee").await);

        let invoked = &AtomicU32::new(0);
        let result = cb
            .call("prediction_fee", || async move {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, OracleError>(1)
            })
            .await;

        assert!(matches!(result, Err(OracleError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invokes_again_after_reset_timeout() {
        let cb = CircuitBreaker::new(2, Duration::from_secs(30));
        fail_n(&cb, "prediction_fraud", 2).await;

        tokio::time::advance(Duration::from_secs(31)).await;

        let invoked = &AtomicU32::new(0);
        let result = cb
            .call("prediction_fraud", || async move {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, OracleError>("ok")
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
        assert_eq!(cb.snapshot("prediction_fraud").await.state, BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let cb = CircuitBreaker::new(2, Duration::from_secs(30));
        fail_n(&cb, "svc", 2).await;
        tokio::time::advance(Duration::from_secs(31)).await;

        fail_n(&cb, "svc", 1).await;

        let state = cb.snapshot("svc").await;
        assert_eq!(state.state, BreakerState::Open);
        assert!(cb.is_open("svc").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_while_half_open() {
        let cb = CircuitBreaker::new(1, Duration::from_secs(10));
        fail_n(&cb, "svc", 1).await;
        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(cb.acquire("svc").await.unwrap(), Admission::Trial);
        assert!(matches!(cb.acquire("svc").await, Err(OracleError::CircuitOpen { .. })));

        cb.record_success("svc").await;
        assert_eq!(cb.acquire("svc").await.unwrap(), Admission::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_during_trial_keeps_breaker_half_open() {
        let cb = CircuitBreaker::new(2, Duration::from_secs(30));
        fail_n(&cb, "svc", 2).await;
        tokio::time::advance(Duration::from_secs(31)).await;

        let result = cb
            .call("svc", || async { Err::<(), _>(OracleError::Validation("bad".into())) })
            .await;
        assert!(matches!(result, Err(OracleError::Validation(_))));

        let state = cb.snapshot("svc").await;
        assert_eq!(state.state, BreakerState::HalfOpen);
        assert_eq!(state.consecutive_failures, 2);
        assert!(state.trial_started_at.is_none());

        // the next caller gets the trial, and a real failure reopens
        assert_eq!(cb.acquire("svc").await.unwrap(), Admission::Trial);
        cb.record_failure("svc").await;
        assert_eq!(cb.snapshot("svc").await.state, BreakerState::Open);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(60));
        fail_n(&cb, "svc", 2).await;
        cb.call("svc", || async { Ok::<_, OracleError>(()) }).await.unwrap();

        assert_eq!(cb.snapshot("svc").await.consecutive_failures, 0);
        fail_n(&cb, "svc", 2).await;
        assert!(!cb.is_open("svc").await);
    }

    #[tokio::test]
    async fn test_validation_errors_do_not_trip() {
        let cb = CircuitBreaker::new(1, Duration::from_secs(60));
        for _ in 0..3 {
            let _ = cb
                .call("svc", || async { Err::<(), _>(OracleError::Validation("bad".into())) })
                .await;
        }
        assert!(!cb.is_open("svc").await);
    }

    #[tokio::test]
    async fn test_services_are_isolated() {
        let cb = CircuitBreaker::new(1, Duration::from_secs(60));
        fail_n(&cb, "a", 1).await;

        assert!(cb.is_open("a").await);
        assert!(!cb.is_open("b").await);

        cb.reset("a").await;
        assert!(!cb.is_open("a").await);
    }
}
