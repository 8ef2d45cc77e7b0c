//! Request orchestrator - the entry point a route handler calls.
//!
//! Each request walks `received -> rate_limit_checked -> validated ->
//! featurized -> predicted -> responded`, and any failure jumps straight to
//! `error_responded`. Whatever happens, the caller gets a typed, timestamped,
//! status-tagged [`OracleResponse`].

use crate::oracle::cache::ResponseCache;
use crate::oracle::circuit_breaker::{BreakerState, CircuitBreaker};
use crate::oracle::data_sources::{OracleDataSources, CHAIN_NODE, FEE_AGGREGATOR, INFERENCE, PRICE_ORACLE};
use crate::oracle::error::{OracleError, OracleResult};
use crate::oracle::features::FeatureComputer;
use crate::oracle::metrics::{
    MetricsSnapshot, OracleMetricsCollector, CACHE_HITS_TOTAL, ERRORS_TOTAL, RATE_LIMITED_TOTAL,
    REQUESTS_TOTAL, STALE_SERVED_TOTAL,
};
use crate::oracle::rate_limit::RateLimiter;
use crate::oracle::resilience::ResilienceEnvelope;
use crate::oracle::scorer::PredictionEngine;
use crate::oracle::types::{
    FeePrediction, FraudPrediction, FraudReport, OracleConfig, OracleResponse, TransferReceipt,
};
use crate::oracle::upstream::UpstreamClient;
use crate::oracle::validation::{validate_fee_request, validate_fraud_request, validate_transfer};
use crate::types::{FeeRequest, FraudRequest, SignedTransfer};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

pub const FEE_SERVICE: &str = "prediction_fee";
pub const FRAUD_SERVICE: &str = "prediction_fraud";
pub const TRANSFER_SERVICE: &str = "transfer_submission";

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStage {
    Received,
    RateLimitChecked,
    Validated,
    Featurized,
    Predicted,
    Submitted,
    Responded,
    ErrorResponded,
}

impl RequestStage {
    fn advance(&mut self, next: RequestStage) {
        debug!("Request stage {:?} -> {:?}", self, next);
        *self = next;
    }
}

/// Breaker view of one service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub service: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
}

/// Overall service health.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub inference_enabled: bool,
    pub services: Vec<ServiceHealth>,
    pub metrics: MetricsSnapshot,
}

/// Fee and fraud prediction service.
pub struct PredictiveOracle {
    config: OracleConfig,
    rate_limiter: RateLimiter,
    envelope: Arc<ResilienceEnvelope>,
    upstream: Arc<UpstreamClient>,
    features: FeatureComputer,
    engine: PredictionEngine,
    metrics: OracleMetricsCollector,
    fee_results: ResponseCache<FeePrediction>,
    fraud_results: ResponseCache<FraudPrediction>,
}

impl PredictiveOracle {
    /// Wire up every component from configuration and a set of upstreams.
    pub fn new(config: OracleConfig, sources: OracleDataSources) -> Self {
        let metrics = OracleMetricsCollector::new();
        let breaker = Arc::new(CircuitBreaker::new(
            config.circuit_breaker_failure_threshold,
            config.circuit_reset_timeout(),
        ));
        let envelope = Arc::new(ResilienceEnvelope::new(
            breaker,
            config.retry_max_attempts,
            config.retry_base_delay(),
            config.request_timeout(),
        ));
        let upstream = Arc::new(UpstreamClient::new(sources, envelope.clone(), metrics.clone(), &config));
        let features = FeatureComputer::new(upstream.clone(), config.large_transaction_usd);
        let engine = PredictionEngine::new(upstream.clone(), metrics.clone());

        info!(
            "Created PredictiveOracle (strategy: {}, rate limit {} per {:?})",
            engine.strategy().name(),
            config.rate_limit_max_requests,
            config.rate_limit_window()
        );

        Self {
            rate_limiter: RateLimiter::new(config.rate_limit_window(), config.rate_limit_max_requests),
            fee_results: ResponseCache::new("fee_prediction", config.cache_ttl(), config.max_cache_entries),
            fraud_results: ResponseCache::new("fraud_prediction", config.cache_ttl(), config.max_cache_entries),
            config,
            envelope,
            upstream,
            features,
            engine,
            metrics,
        }
    }

    /// Predict the fee for a transfer.
    #[instrument(skip(self, request), fields(client = %client, token = %request.token))]
    pub async fn predict_fee(&self, client: &str, request: FeeRequest) -> OracleResponse<FeePrediction> {
        let started = Instant::now();
        let mut stage = RequestStage::Received;
        let result = self.run_fee(client, &request, &mut stage).await;
        self.respond("predict_fee", started, &mut stage, result).await
    }

    /// Score a transfer for fraud risk.
    #[instrument(skip(self, request), fields(client = %client))]
    pub async fn predict_fraud(&self, client: &str, request: FraudRequest) -> OracleResponse<FraudReport> {
        let started = Instant::now();
        let mut stage = RequestStage::Received;
        let result = self
            .run_fraud(client, &request, &mut stage)
            .await
            .map(FraudReport::from);
        self.respond("predict_fraud", started, &mut stage, result).await
    }

    /// Forward a pre-signed transfer to the chain node.
    ///
    /// Never retried and never served from a fallback: a failure here is
    /// reported as is.
    #[instrument(skip(self, transfer), fields(client = %client))]
    pub async fn submit_transfer(&self, client: &str, transfer: SignedTransfer) -> OracleResponse<TransferReceipt> {
        let started = Instant::now();
        let mut stage = RequestStage::Received;
        let result = self.run_transfer(client, &transfer, &mut stage).await;
        self.respond("submit_transfer", started, &mut stage, result).await
    }

    /// Breaker state per service plus metric counters.
    pub async fn health(&self) -> HealthReport {
        let breaker = self.envelope.breaker();
        let mut services = Vec::new();
        for service in [
            FEE_SERVICE,
            FRAUD_SERVICE,
            TRANSFER_SERVICE,
            CHAIN_NODE,
            PRICE_ORACLE,
            FEE_AGGREGATOR,
            INFERENCE,
        ] {
            let state = breaker.snapshot(service).await;
            services.push(ServiceHealth {
                service: service.to_string(),
                state: state.state,
                consecutive_failures: state.consecutive_failures,
            });
        }

        let degraded = services.iter().any(|s| s.state != BreakerState::Closed);
        HealthReport {
            status: if degraded { "degraded" } else { "healthy" }.to_string(),
            timestamp: Utc::now(),
            inference_enabled: self.upstream.inference_available(),
            services,
            metrics: self.metrics.get_metrics_snapshot().await,
        }
    }

    pub fn config(&self) -> &OracleConfig {
        &self.config
    }

    pub fn metrics(&self) -> &OracleMetricsCollector {
        &self.metrics
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        self.envelope.breaker()
    }

    async fn admit(&self, client: &str, stage: &mut RequestStage) -> OracleResult<()> {
        self.metrics.increment_counter(REQUESTS_TOTAL).await;
        if !self.rate_limiter.check_and_consume(client).await {
            return Err(OracleError::RateLimited {
                client: client.to_string(),
            });
        }
        stage.advance(RequestStage::RateLimitChecked);
        Ok(())
    }

    async fn run_fee(&self, client: &str, request: &FeeRequest, stage: &mut RequestStage) -> OracleResult<FeePrediction> {
        self.admit(client, stage).await?;
        let request = validate_fee_request(request)?;
        stage.advance(RequestStage::Validated);

        let amount = request.amount.to_string();
        let token = request.token.to_lowercase();
        let key = ResponseCache::<FeePrediction>::key(
            "fee",
            &[amount.as_str(), token.as_str(), request.priority.as_str()],
        );
        if let Some(hit) = self.fee_results.get(&key).await {
            self.metrics.increment_counter(CACHE_HITS_TOTAL).await;
            stage.advance(RequestStage::Predicted);
            return Ok(hit);
        }

        let (features, sources) = self.features.fee_features(&request).await;
        stage.advance(RequestStage::Featurized);

        // Inference carries its own, smaller budget inside the engine, so the
        // prediction itself is only gated by its breaker.
        let engine = &self.engine;
        let result = self
            .envelope
            .with_circuit_breaker(FEE_SERVICE, || engine.predict_fee(&features, sources))
            .await;

        match result {
            Ok(prediction) => {
                stage.advance(RequestStage::Predicted);
                self.fee_results.set(&key, prediction.clone()).await;
                Ok(prediction)
            }
            Err(err) => self.stale_or(&self.fee_results, &key, err, stage).await,
        }
    }

    async fn run_fraud(
        &self,
        client: &str,
        request: &FraudRequest,
        stage: &mut RequestStage,
    ) -> OracleResult<FraudPrediction> {
        self.admit(client, stage).await?;
        let request = validate_fraud_request(request)?;
        stage.advance(RequestStage::Validated);

        let amount = request.amount.to_string();
        let timestamp = request.timestamp.map(|t| t.to_string()).unwrap_or_default();
        let key = ResponseCache::<FraudPrediction>::key(
            "fraud",
            &[request.sender.as_str(), request.recipient.as_str(), amount.as_str(), timestamp.as_str()],
        );
        if let Some(hit) = self.fraud_results.get(&key).await {
            self.metrics.increment_counter(CACHE_HITS_TOTAL).await;
            stage.advance(RequestStage::Predicted);
            return Ok(hit);
        }

        let (features, sources) = self.features.fraud_features(&request).await;
        stage.advance(RequestStage::Featurized);

        let engine = &self.engine;
        let result = self
            .envelope
            .with_circuit_breaker(FRAUD_SERVICE, || engine.predict_fraud(&features, sources))
            .await;

        match result {
            Ok(prediction) => {
                stage.advance(RequestStage::Predicted);
                self.fraud_results.set(&key, prediction.clone()).await;
                Ok(prediction)
            }
            Err(err) => self.stale_or(&self.fraud_results, &key, err, stage).await,
        }
    }

    async fn run_transfer(
        &self,
        client: &str,
        transfer: &SignedTransfer,
        stage: &mut RequestStage,
    ) -> OracleResult<TransferReceipt> {
        self.admit(client, stage).await?;
        let transfer = validate_transfer(transfer)?;
        stage.advance(RequestStage::Validated);

        let upstream = &self.upstream;
        let payload = &transfer.payload;
        let pending = self
            .envelope
            .execute_once(TRANSFER_SERVICE, move || upstream.submit_transaction(payload))
            .await?;
        stage.advance(RequestStage::Submitted);

        info!("Submitted transfer {} from {}", pending.hash, transfer.sender);
        Ok(TransferReceipt {
            hash: pending.hash,
            sender: transfer.sender,
            recipient: transfer.recipient,
            amount: transfer.amount,
        })
    }

    /// Serve the last good result for `key` instead of `err`, if there is one.
    async fn stale_or<T>(
        &self,
        cache: &ResponseCache<T>,
        key: &str,
        err: OracleError,
        stage: &mut RequestStage,
    ) -> OracleResult<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        match cache.get_stale(key).await {
            Some(stale) => {
                warn!("Prediction failed ({}), serving stale result for {}", err, key);
                self.metrics.increment_counter(STALE_SERVED_TOTAL).await;
                stage.advance(RequestStage::Predicted);
                Ok(stale)
            }
            None => Err(err),
        }
    }

    async fn respond<T>(
        &self,
        endpoint: &str,
        started: Instant,
        stage: &mut RequestStage,
        result: OracleResult<T>,
    ) -> OracleResponse<T> {
        self.metrics.record_latency(endpoint, started.elapsed()).await;
        match result {
            Ok(data) => {
                stage.advance(RequestStage::Responded);
                OracleResponse::success(data)
            }
            Err(err) => {
                let counter = match err {
                    OracleError::RateLimited { .. } => RATE_LIMITED_TOTAL,
                    _ => ERRORS_TOTAL,
                };
                self.metrics.increment_counter(counter).await;
                warn!("{} failed at stage {:?}: {} ({})", endpoint, stage, err, err.code());
                stage.advance(RequestStage::ErrorResponded);
                OracleResponse::failure(&err)
            }
        }
    }
}
