//! Core request types for the Aptash prediction service.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of an inbound caller, usually the client IP.
pub type ClientKey = String;

/// Fee urgency requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Multiplier applied to the base fee.
    pub fn multiplier(&self) -> f64 {
        match self {
            Priority::Low => 0.5,
            Priority::Normal => 1.0,
            Priority::High => 2.5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            other => Err(format!("unknown priority '{}', expected low, normal or high", other)),
        }
    }
}

/// Inbound fee prediction request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeRequest {
    /// Transfer amount in token units
    pub amount: f64,
    /// Token symbol, e.g. "APT"
    pub token: String,
    #[serde(default)]
    pub priority: Priority,
}

/// Inbound fraud prediction request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudRequest {
    pub sender: String,
    pub recipient: String,
    /// Transfer amount in APT
    pub amount: f64,
    /// Unix timestamp (seconds) the caller attached to the transfer
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// A transfer that has already been signed by the wallet.
///
/// The payload is forwarded verbatim to the chain node; this crate never
/// signs anything itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedTransfer {
    pub sender: String,
    pub recipient: String,
    /// Amount in octas
    pub amount: u64,
    /// Signed transaction body in the node's JSON submission format
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_parsing() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!(" low ".parse::<Priority>().unwrap(), Priority::Low);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_priority_multiplier_ordering() {
        assert!(Priority::High.multiplier() > Priority::Normal.multiplier());
        assert!(Priority::Normal.multiplier() > Priority::Low.multiplier());
    }

    #[test]
    fn test_fee_request_default_priority() {
        let req: FeeRequest = serde_json::from_str(r#"{"amount": 5.0, "token": "APT"}"#).unwrap();
        assert_eq!(req.priority, Priority::Normal);
    }
}
