//! Aptash oracle - fee and fraud-risk predictions for Aptos transfers.
//!
//! Combines several unreliable upstreams (chain node, price oracle, fee
//! aggregator, optional inference endpoint) into bounded-failure answers,
//! behind per-client rate limiting, response caching, retries, timeouts and
//! per-service circuit breakers.

pub mod types;
pub mod oracle;

// Re-export main types for convenience
pub use types::{FeeRequest, FraudRequest, Priority, SignedTransfer};
pub use oracle::{OracleBuilder, OracleConfig, OracleResponse, PredictiveOracle};
