//! Account address normalization.
//!
//! Addresses reach the oracle in several shapes: a hex string, a raw byte
//! array, or a wrapper object with a `data` field holding either. All of
//! them go through [`parse_address`], which yields the canonical
//! `0x` + 64 lowercase hex form or a typed error.

use serde::Deserialize;
use std::fmt;
use thiserror::Error;

/// Length of an account address in bytes.
pub const ADDRESS_LENGTH: usize = 32;

/// The shapes an address may arrive in.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum AddressInput {
    Hex(String),
    Bytes(Vec<u8>),
    Wrapped { data: Box<AddressInput> },
}

impl From<&str> for AddressInput {
    fn from(value: &str) -> Self {
        AddressInput::Hex(value.to_string())
    }
}

impl From<String> for AddressInput {
    fn from(value: String) -> Self {
        AddressInput::Hex(value)
    }
}

impl From<Vec<u8>> for AddressInput {
    fn from(value: Vec<u8>) -> Self {
        AddressInput::Bytes(value)
    }
}

/// Canonical account address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParsedAddress(String);

impl ParsedAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ParsedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressParseError {
    #[error("address is empty")]
    Empty,
    #[error("address contains non-hex character {0:?}")]
    InvalidCharacter(char),
    #[error("address has {0} hex digits, at most 64 allowed")]
    TooLong(usize),
    #[error("address has {0} bytes, expected 32")]
    WrongByteLength(usize),
    #[error("address wrapper nested too deeply")]
    TooDeep,
}

/// Wrapper depth accepted before giving up.
const MAX_NESTING: usize = 4;

/// Parse any accepted address shape into its canonical form.
///
/// Short hex strings are left-padded with zeros, so `0x1` is the same
/// account as `0x000...001`.
pub fn parse_address(input: &AddressInput) -> Result<ParsedAddress, AddressParseError> {
    parse_nested(input, 0)
}

/// Convenience wrapper for the common string case.
pub fn parse_address_str(input: &str) -> Result<ParsedAddress, AddressParseError> {
    parse_hex(input)
}

fn parse_nested(input: &AddressInput, depth: usize) -> Result<ParsedAddress, AddressParseError> {
    match input {
        AddressInput::Hex(raw) => parse_hex(raw),
        AddressInput::Bytes(bytes) => parse_bytes(bytes),
        AddressInput::Wrapped { data } => {
            if depth >= MAX_NESTING {
                return Err(AddressParseError::TooDeep);
            }
            parse_nested(data, depth + 1)
        }
    }
}

fn parse_hex(raw: &str) -> Result<ParsedAddress, AddressParseError> {
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if digits.is_empty() {
        return Err(AddressParseError::Empty);
    }
    if let Some(bad) = digits.chars().find(|c| !c.is_ascii_hexdigit()) {
        return Err(AddressParseError::InvalidCharacter(bad));
    }
    if digits.len() > ADDRESS_LENGTH * 2 {
        return Err(AddressParseError::TooLong(digits.len()));
    }

    Ok(ParsedAddress(format!(
        "0x{:0>width$}",
        digits.to_ascii_lowercase(),
        width = ADDRESS_LENGTH * 2
    )))
}

fn parse_bytes(bytes: &[u8]) -> Result<ParsedAddress, AddressParseError> {
    if bytes.len() != ADDRESS_LENGTH {
        return Err(AddressParseError::WrongByteLength(bytes.len()));
    }
    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    Ok(ParsedAddress(format!("0x{}", hex)))
}
