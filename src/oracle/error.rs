//! Error taxonomy for the prediction oracle.
//!
//! Only validation failures, exhausted upstream failures, open circuits and
//! timeouts are expected to reach the orchestrator. Upstream rate limiting and
//! unparsable inference output are absorbed closer to the source.

use serde::Serialize;
use thiserror::Error;

/// Errors produced anywhere inside the oracle.
#[derive(Debug, Clone, Error)]
pub enum OracleError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("rate limit exceeded for client {client}")]
    RateLimited { client: String },
    #[error("upstream {service} rate limited the request")]
    UpstreamRateLimited { service: String },
    #[error("upstream {service} unavailable: {message}")]
    UpstreamUnavailable {
        service: String,
        message: String,
        /// HTTP status when the upstream answered at all
        status: Option<u16>,
    },
    #[error("service {service} temporarily unavailable: circuit open")]
    CircuitOpen { service: String },
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },
    #[error("unparsable inference output: {0}")]
    PredictionParse(String),
    #[error("response decode error: {0}")]
    Decode(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification used to pick a transport status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    ClientError,
    TransientServiceError,
    PermanentFailure,
}

impl OracleError {
    /// Build an upstream failure from a reqwest transport error.
    pub fn transport(service: &str, err: reqwest::Error) -> Self {
        OracleError::UpstreamUnavailable {
            service: service.to_string(),
            message: err.to_string(),
            status: err.status().map(|s| s.as_u16()),
        }
    }

    /// Build an upstream failure from a non-success HTTP status.
    pub fn from_status(service: &str, status: reqwest::StatusCode, body: String) -> Self {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return OracleError::UpstreamRateLimited {
                service: service.to_string(),
            };
        }
        OracleError::UpstreamUnavailable {
            service: service.to_string(),
            message: format!("status {}: {}", status.as_u16(), body),
            status: Some(status.as_u16()),
        }
    }

    /// Whether another attempt could plausibly succeed.
    ///
    /// Transport failures (no status) and 5xx answers are retryable; 4xx,
    /// validation and breaker rejections never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            OracleError::UpstreamUnavailable { status, .. } => match status {
                None => true,
                Some(code) => *code >= 500,
            },
            OracleError::Timeout { .. } => true,
            _ => false,
        }
    }

    pub fn classify(&self) -> ErrorClass {
        match self {
            OracleError::Validation(_) | OracleError::RateLimited { .. } => ErrorClass::ClientError,
            OracleError::UpstreamRateLimited { .. }
            | OracleError::CircuitOpen { .. }
            | OracleError::Timeout { .. } => ErrorClass::TransientServiceError,
            OracleError::UpstreamUnavailable { status, .. } => match status {
                Some(code) if (400..500).contains(code) => ErrorClass::PermanentFailure,
                _ => ErrorClass::TransientServiceError,
            },
            OracleError::PredictionParse(_) | OracleError::Decode(_) | OracleError::Internal(_) => {
                ErrorClass::PermanentFailure
            }
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            OracleError::Validation(_) => "VALIDATION_ERROR",
            OracleError::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            OracleError::UpstreamRateLimited { .. } => "UPSTREAM_RATE_LIMITED",
            OracleError::UpstreamUnavailable { .. } => "UPSTREAM_UNAVAILABLE",
            OracleError::CircuitOpen { .. } => "SERVICE_CIRCUIT_OPEN",
            OracleError::Timeout { .. } => "REQUEST_TIMEOUT",
            OracleError::PredictionParse(_) => "PREDICTION_PARSE_ERROR",
            OracleError::Decode(_) => "UPSTREAM_DECODE_ERROR",
            OracleError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            OracleError::RateLimited { .. } => 429,
            _ => match self.classify() {
                ErrorClass::ClientError => 400,
                ErrorClass::TransientServiceError => 503,
                ErrorClass::PermanentFailure => 500,
            },
        }
    }
}

pub type OracleResult<T> = Result<T, OracleError>;
