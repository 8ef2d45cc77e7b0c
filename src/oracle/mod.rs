//! Oracle module - fee and fraud prediction behind a resilience envelope.
//!
//! Leaf to root: injected state stores, rate limiting and response caching,
//! raw upstream sources, the paced and cached upstream client, the
//! retry/timeout/breaker envelope, featurization, the prediction engine, and
//! finally the [`PredictiveOracle`] request orchestrator.

pub mod address;
pub mod cache;
pub mod circuit_breaker;
pub mod data_sources;
pub mod error;
pub mod features;
pub mod metrics;
pub mod predictive_oracle;
pub mod rate_limit;
pub mod resilience;
pub mod scorer;
pub mod storage;
pub mod types;
pub mod upstream;
pub mod validation;

// Re-export main public types and the primary oracle
pub use predictive_oracle::{HealthReport, PredictiveOracle, RequestStage};
pub use types::{
    FeePrediction, FraudPrediction, FraudReport, OracleConfig, OracleResponse, ResponseStatus,
    TransferReceipt,
};
pub use error::{ErrorClass, OracleError, OracleResult};

// Re-export other key components for advanced usage
pub use address::{parse_address, AddressInput, AddressParseError, ParsedAddress};
pub use cache::ResponseCache;
pub use circuit_breaker::{BreakerState, CircuitBreaker, CircuitState};
pub use data_sources::{ChainSource, FeeAggregatorSource, InferenceSource, OracleDataSources, PriceSource};
pub use rate_limit::{RateLimiter, UpstreamCadence};
pub use resilience::ResilienceEnvelope;
pub use scorer::{ClosedForm, InferenceRefined, PredictionEngine, PredictionStrategy};
pub use storage::{InMemoryStore, MokaStore, StateStore};

/// Oracle builder for convenient construction with sensible defaults.
pub struct OracleBuilder {
    config: OracleConfig,
}

impl OracleBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: OracleConfig::default(),
        }
    }

    /// Start from configuration read from the environment.
    pub fn from_env() -> Self {
        Self {
            config: OracleConfig::from_env(),
        }
    }

    /// Set the chain node REST endpoint.
    pub fn with_node_url(mut self, url: impl Into<String>) -> Self {
        self.config.aptos_node_url = url.into();
        self
    }

    /// Set the price oracle endpoint and optional key.
    pub fn with_price_api(mut self, url: impl Into<String>, api_key: Option<String>) -> Self {
        self.config.price_api_url = url.into();
        self.config.price_api_key = api_key;
        self
    }

    /// Set the fee aggregator endpoint.
    pub fn with_fee_aggregator(mut self, url: impl Into<String>) -> Self {
        self.config.fee_aggregator_url = url.into();
        self
    }

    /// Enable inference refinement against the given endpoint and model.
    pub fn with_inference(mut self, url: impl Into<String>, model: impl Into<String>, api_key: String) -> Self {
        self.config.inference_api_url = url.into();
        self.config.inference_model = model.into();
        self.config.inference_api_key = Some(api_key);
        self
    }

    /// Set inbound rate limiting.
    pub fn with_rate_limit(mut self, window_ms: u64, max_requests: u32) -> Self {
        self.config.rate_limit_window_ms = window_ms;
        self.config.rate_limit_max_requests = max_requests;
        self
    }

    /// Set cache TTL in seconds.
    pub fn with_cache_ttl(mut self, ttl_seconds: u64) -> Self {
        self.config.cache_ttl_seconds = ttl_seconds;
        self
    }

    /// Set max cache entries.
    pub fn with_max_cache_entries(mut self, max_entries: u64) -> Self {
        self.config.max_cache_entries = max_entries;
        self
    }

    /// Set retry budget and base backoff.
    pub fn with_retry(mut self, max_attempts: u32, base_delay_ms: u64) -> Self {
        self.config.retry_max_attempts = max_attempts;
        self.config.retry_base_delay_ms = base_delay_ms;
        self
    }

    /// Set circuit breaker configuration.
    pub fn with_circuit_breaker(mut self, failure_threshold: u32, reset_timeout_ms: u64) -> Self {
        self.config.circuit_breaker_failure_threshold = failure_threshold;
        self.config.circuit_breaker_reset_timeout_ms = reset_timeout_ms;
        self
    }

    /// Set the per-attempt request timeout.
    pub fn with_request_timeout(mut self, timeout_ms: u64) -> Self {
        self.config.request_timeout_ms = timeout_ms;
        self
    }

    /// Set the inference budget; it is still capped at half the request timeout.
    pub fn with_inference_timeout(mut self, timeout_ms: u64) -> Self {
        self.config.inference_timeout_ms = timeout_ms;
        self
    }

    /// Set the minimum spacing between calls to one upstream.
    pub fn with_upstream_min_interval(mut self, interval_ms: u64) -> Self {
        self.config.upstream_min_interval_ms = interval_ms;
        self
    }

    /// Set the USD value above which a transfer counts as large.
    pub fn with_large_transaction_usd(mut self, threshold: f64) -> Self {
        self.config.large_transaction_usd = threshold;
        self
    }

    pub fn config(&self) -> &OracleConfig {
        &self.config
    }

    /// Build the oracle with HTTP-backed upstreams.
    pub fn build(self) -> anyhow::Result<PredictiveOracle> {
        let sources = OracleDataSources::from_config(&self.config)?;
        Ok(PredictiveOracle::new(self.config, sources))
    }

    /// Build the oracle over caller-supplied upstreams.
    pub fn build_with_sources(self, sources: OracleDataSources) -> PredictiveOracle {
        PredictiveOracle::new(self.config, sources)
    }
}

impl Default for OracleBuilder {
    fn default() -> Self {
        Self::new()
    }
}
