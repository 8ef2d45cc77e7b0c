//! Core types and data structures for the prediction oracle.

use crate::oracle::error::{ErrorClass, OracleError};
use crate::types::Priority;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Oracle configuration. Every field has a safe default so the service runs
/// with zero configuration, just with degraded accuracy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Aptos fullnode REST base URL
    pub aptos_node_url: String,
    /// Price oracle base URL
    pub price_api_url: String,
    /// Price oracle API key
    pub price_api_key: Option<String>,
    /// Protocol/fee aggregator base URL
    pub fee_aggregator_url: String,
    /// Text-generation inference base URL
    pub inference_api_url: String,
    /// Inference API key; refinement is disabled without one
    pub inference_api_key: Option<String>,
    /// Inference model name
    pub inference_model: String,
    /// Budget for one inference call in milliseconds, capped at half the
    /// request timeout
    pub inference_timeout_ms: u64,
    /// Inbound rate-limit window in milliseconds
    pub rate_limit_window_ms: u64,
    /// Inbound requests allowed per client per window
    pub rate_limit_max_requests: u32,
    /// Response cache TTL in seconds
    pub cache_ttl_seconds: u64,
    /// Maximum entries per response cache
    pub max_cache_entries: u64,
    /// Retries after the first attempt
    pub retry_max_attempts: u32,
    /// Base backoff delay in milliseconds
    pub retry_base_delay_ms: u64,
    /// Consecutive failures before a circuit opens
    pub circuit_breaker_failure_threshold: u32,
    /// How long an open circuit rejects calls, in milliseconds
    pub circuit_breaker_reset_timeout_ms: u64,
    /// Per-attempt request timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Minimum spacing between calls to one upstream, in milliseconds
    pub upstream_min_interval_ms: u64,
    /// USD value above which a transfer counts as large
    pub large_transaction_usd: f64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            aptos_node_url: "https://fullnode.mainnet.aptoslabs.com/v1".to_string(),
            price_api_url: "https://api.coingecko.com/api/v3".to_string(),
            price_api_key: None,
            fee_aggregator_url: "https://api.llama.fi".to_string(),
            inference_api_url: "https://api-inference.huggingface.co/models".to_string(),
            inference_api_key: None,
            inference_model: "gpt2".to_string(),
            inference_timeout_ms: 4_000,
            rate_limit_window_ms: 60_000,
            rate_limit_max_requests: 60,
            cache_ttl_seconds: 60,
            max_cache_entries: 10_000,
            retry_max_attempts: 3,
            retry_base_delay_ms: 100,
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_reset_timeout_ms: 60_000,
            request_timeout_ms: 10_000,
            upstream_min_interval_ms: 1_200,
            large_transaction_usd: 10_000.0,
        }
    }
}

impl OracleConfig {
    /// Load configuration from environment variables over the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            aptos_node_url: env_string("APTOS_NODE_URL").unwrap_or(defaults.aptos_node_url),
            price_api_url: env_string("COINGECKO_API_URL").unwrap_or(defaults.price_api_url),
            price_api_key: env_string("COINGECKO_API_KEY"),
            fee_aggregator_url: env_string("DEFILLAMA_API_URL").unwrap_or(defaults.fee_aggregator_url),
            inference_api_url: env_string("INFERENCE_API_URL").unwrap_or(defaults.inference_api_url),
            inference_api_key: env_string("INFERENCE_API_KEY"),
            inference_model: env_string("INFERENCE_MODEL").unwrap_or(defaults.inference_model),
            inference_timeout_ms: env_parse("INFERENCE_TIMEOUT_MS", defaults.inference_timeout_ms),
            rate_limit_window_ms: env_parse("RATE_LIMIT_WINDOW_MS", defaults.rate_limit_window_ms),
            rate_limit_max_requests: env_parse("RATE_LIMIT_MAX", defaults.rate_limit_max_requests),
            cache_ttl_seconds: env_parse("CACHE_TTL_SECONDS", defaults.cache_ttl_seconds),
            max_cache_entries: env_parse("CACHE_MAX_ENTRIES", defaults.max_cache_entries),
            retry_max_attempts: env_parse("RETRY_MAX_ATTEMPTS", defaults.retry_max_attempts),
            retry_base_delay_ms: env_parse("RETRY_BASE_DELAY_MS", defaults.retry_base_delay_ms),
            circuit_breaker_failure_threshold: env_parse(
                "CIRCUIT_FAILURE_THRESHOLD",
                defaults.circuit_breaker_failure_threshold,
            ),
            circuit_breaker_reset_timeout_ms: env_parse(
                "CIRCUIT_RESET_TIMEOUT_MS",
                defaults.circuit_breaker_reset_timeout_ms,
            ),
            request_timeout_ms: env_parse("REQUEST_TIMEOUT_MS", defaults.request_timeout_ms),
            upstream_min_interval_ms: env_parse("UPSTREAM_MIN_INTERVAL_MS", defaults.upstream_min_interval_ms),
            large_transaction_usd: env_parse("LARGE_TRANSACTION_USD", defaults.large_transaction_usd),
        }
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn circuit_reset_timeout(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_reset_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Time allowed for one inference call, never more than half the
    /// request timeout.
    pub fn inference_timeout(&self) -> Duration {
        Duration::from_millis(self.inference_timeout_ms.min(self.request_timeout_ms / 2))
    }

    pub fn upstream_min_interval(&self) -> Duration {
        Duration::from_millis(self.upstream_min_interval_ms)
    }

    /// Whether the inference refinement can be attempted at all.
    pub fn inference_enabled(&self) -> bool {
        self.inference_api_key.is_some()
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr + Copy + std::fmt::Debug>(key: &str, default: T) -> T {
    match env_string(key) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("Ignoring unparsable {}={:?}, using default {:?}", key, raw, default);
            default
        }),
        None => default,
    }
}

/// Reputation derived from an account's on-chain history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationRecord {
    pub address: String,
    /// Score in [0, 1]; 0.5 is neutral
    pub score: f64,
    pub transaction_count: u64,
    pub account_age_days: u64,
}

/// Current price of a token in USD.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenQuote {
    pub usd: f64,
    pub usd_24h_change: f64,
}

/// Label for how a requested amount compares with the sender's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternLabel {
    NoHistory,
    UnusuallyLarge,
    UnusualAmount,
    NewAccount,
    Normal,
}

impl PatternLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternLabel::NoHistory => "no_history",
            PatternLabel::UnusuallyLarge => "unusually_large",
            PatternLabel::UnusualAmount => "unusual_amount",
            PatternLabel::NewAccount => "new_account",
            PatternLabel::Normal => "normal",
        }
    }
}

/// Comparison of the requested amount against the sender's past transfers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternAnalysis {
    pub label: PatternLabel,
    /// Risk contribution in [0, 1]
    pub risk_contribution: f64,
    pub historical_average: Option<f64>,
    pub deviation: Option<f64>,
}

/// Market context for a transfer amount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketContext {
    pub usd_value: f64,
    pub is_large: bool,
    pub is_micro: bool,
    pub volatility_pct: f64,
}

/// Inputs to the fee model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeFeatures {
    pub amount: f64,
    pub token_price_usd: f64,
    pub token_price_24h_change_pct: f64,
    /// Network congestion in [0, 1]
    pub network_load: f64,
    pub priority: Priority,
    pub historical_mean_fee: f64,
}

/// Inputs to the fraud model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudFeatures {
    pub sender: String,
    pub recipient: String,
    pub amount: f64,
    /// Unix seconds supplied with the transfer
    pub timestamp: Option<i64>,
    pub sender_reputation: ReputationRecord,
    pub recipient_reputation: ReputationRecord,
    pub pattern_analysis: PatternAnalysis,
    pub market_context: MarketContext,
}

/// Which upstreams contributed to a prediction and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataOrigin {
    /// Fetched from the upstream just now
    Live,
    /// Served from the fresh cache
    Cached,
    /// Served from an expired cache entry after an upstream failure
    Stale,
    /// Hard-coded fallback value
    Fallback,
}

/// A data source that fed a prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    pub name: String,
    pub origin: DataOrigin,
}

impl DataSource {
    pub fn new(name: &str, origin: DataOrigin) -> Self {
        Self {
            name: name.to_string(),
            origin,
        }
    }
}

/// A value together with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Sourced<T> {
    pub value: T,
    pub origin: DataOrigin,
}

impl<T> Sourced<T> {
    pub fn new(value: T, origin: DataOrigin) -> Self {
        Self { value, origin }
    }
}

/// Fee prediction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeePrediction {
    pub predicted_fee: f64,
    pub currency: String,
    pub confidence: f64,
    pub model: String,
    pub contributing_factors: HashMap<String, f64>,
    pub data_sources: Vec<DataSource>,
    pub produced_at: DateTime<Utc>,
}

/// Fraud prediction. The suspicious/high-risk flags are derived from the
/// risk score on every read and are never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudPrediction {
    pub risk_score: f64,
    pub confidence: f64,
    pub model: String,
    pub risk_factors: Vec<String>,
    pub analysis: serde_json::Value,
    pub data_sources: Vec<DataSource>,
    pub produced_at: DateTime<Utc>,
}

/// Risk score above which a transfer is flagged as suspicious.
pub const SUSPICIOUS_THRESHOLD: f64 = 0.6;
/// Risk score above which a transfer is flagged as high risk.
pub const HIGH_RISK_THRESHOLD: f64 = 0.8;

impl FraudPrediction {
    pub fn is_suspicious(&self) -> bool {
        self.risk_score > SUSPICIOUS_THRESHOLD
    }

    pub fn is_high_risk(&self) -> bool {
        self.risk_score > HIGH_RISK_THRESHOLD
    }
}

/// Wire shape of a fraud prediction with the derived flags filled in.
#[derive(Debug, Clone, Serialize)]
pub struct FraudReport {
    #[serde(flatten)]
    pub prediction: FraudPrediction,
    pub is_suspicious: bool,
    pub is_high_risk: bool,
}

impl From<FraudPrediction> for FraudReport {
    fn from(prediction: FraudPrediction) -> Self {
        Self {
            is_suspicious: prediction.is_suspicious(),
            is_high_risk: prediction.is_high_risk(),
            prediction,
        }
    }
}

/// Node acknowledgement for a submitted transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub hash: String,
    pub sender: String,
    pub recipient: String,
    pub amount: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// Structured error body returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub class: ErrorClass,
    pub http_status: u16,
    pub message: String,
    pub retryable: bool,
}

impl From<&OracleError> for ErrorPayload {
    fn from(err: &OracleError) -> Self {
        Self {
            code: err.code().to_string(),
            class: err.classify(),
            http_status: err.http_status(),
            message: err.to_string(),
            retryable: err.is_retryable() || matches!(err, OracleError::CircuitOpen { .. }),
        }
    }
}

/// Envelope for every externally visible answer: always carries a status and
/// a timestamp, whichever internal path produced it.
#[derive(Debug, Clone, Serialize)]
pub struct OracleResponse<T> {
    pub status: ResponseStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl<T> OracleResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: ResponseStatus::Success,
            timestamp: Utc::now(),
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(err: &OracleError) -> Self {
        Self {
            status: ResponseStatus::Error,
            timestamp: Utc::now(),
            data: None,
            error: Some(ErrorPayload::from(err)),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}
