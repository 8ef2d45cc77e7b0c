//! Inbound request validation.
//!
//! Runs before any network call so malformed requests are rejected cheaply.

use crate::oracle::address::parse_address_str;
use crate::oracle::error::{OracleError, OracleResult};
use crate::types::{FeeRequest, FraudRequest, SignedTransfer};

/// Longest token symbol accepted.
const MAX_SYMBOL_LEN: usize = 16;

/// Validate a fee request, returning it with the token symbol trimmed.
pub fn validate_fee_request(request: &FeeRequest) -> OracleResult<FeeRequest> {
    if !request.amount.is_finite() || request.amount <= 0.0 {
        return Err(OracleError::Validation(format!(
            "amount must be a positive number, got {}",
            request.amount
        )));
    }

    let token = validate_symbol(&request.token)?;
    Ok(FeeRequest {
        amount: request.amount,
        token,
        priority: request.priority,
    })
}

/// Validate a fraud request, returning it with canonical addresses.
pub fn validate_fraud_request(request: &FraudRequest) -> OracleResult<FraudRequest> {
    if !request.amount.is_finite() || request.amount < 0.0 {
        return Err(OracleError::Validation(format!(
            "amount must be a non-negative number, got {}",
            request.amount
        )));
    }

    let sender = parse_address_str(&request.sender)
        .map_err(|e| OracleError::Validation(format!("invalid sender: {}", e)))?;
    let recipient = parse_address_str(&request.recipient)
        .map_err(|e| OracleError::Validation(format!("invalid recipient: {}", e)))?;

    Ok(FraudRequest {
        sender: sender.into_string(),
        recipient: recipient.into_string(),
        amount: request.amount,
        timestamp: request.timestamp,
    })
}

/// Validate a signed transfer before it is forwarded to the node.
pub fn validate_transfer(transfer: &SignedTransfer) -> OracleResult<SignedTransfer> {
    if transfer.amount == 0 {
        return Err(OracleError::Validation("transfer amount must be positive".to_string()));
    }
    if !transfer.payload.is_object() {
        return Err(OracleError::Validation(
            "signed payload must be a JSON object".to_string(),
        ));
    }

    let sender = parse_address_str(&transfer.sender)
        .map_err(|e| OracleError::Validation(format!("invalid sender: {}", e)))?;
    let recipient = parse_address_str(&transfer.recipient)
        .map_err(|e| OracleError::Validation(format!("invalid recipient: {}", e)))?;

    Ok(SignedTransfer {
        sender: sender.into_string(),
        recipient: recipient.into_string(),
        amount: transfer.amount,
        payload: transfer.payload.clone(),
    })
}

fn validate_symbol(raw: &str) -> OracleResult<String> {
    let symbol = raw.trim();
    if symbol.is_empty() {
        return Err(OracleError::Validation("token must not be empty".to_string()));
    }
    if symbol.len() > MAX_SYMBOL_LEN {
        return Err(OracleError::Validation(format!(
            "token symbol longer than {} characters",
            MAX_SYMBOL_LEN
        )));
    }
    if !symbol.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(OracleError::Validation(format!("invalid token symbol {:?}", symbol)));
    }
    Ok(symbol.to_string())
}
