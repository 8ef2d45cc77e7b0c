//! Raw upstream data sources.
//!
//! One narrow async trait per upstream, each with a reqwest implementation.
//! These types only translate HTTP into typed values and typed errors; pacing,
//! caching and fallbacks live in [`crate::oracle::upstream`].

use crate::oracle::error::{OracleError, OracleResult};
use crate::oracle::types::{OracleConfig, TokenQuote};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument};

pub const CHAIN_NODE: &str = "chain_node";
pub const PRICE_ORACLE: &str = "price_oracle";
pub const FEE_AGGREGATOR: &str = "fee_aggregator";
pub const INFERENCE: &str = "inference";

/// Octas per APT.
pub const OCTAS_PER_APT: f64 = 100_000_000.0;

/// Ledger summary from the node root endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerInfo {
    pub chain_id: u8,
    #[serde(deserialize_with = "u64_from_str")]
    pub ledger_version: u64,
    #[serde(deserialize_with = "u64_from_str")]
    pub block_height: u64,
    /// Microseconds since the epoch
    #[serde(deserialize_with = "u64_from_str")]
    pub ledger_timestamp: u64,
}

/// Block summary; only the fields the oracle needs.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockInfo {
    pub block_height: u64,
    pub transaction_count: usize,
}

/// A past transaction sent by an account.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountTransaction {
    pub version: u64,
    /// Microseconds since the epoch
    pub timestamp_us: u64,
    /// Transferred APT, when the payload is a coin transfer
    pub amount: Option<f64>,
}

/// Node acknowledgement of a submitted transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTransaction {
    pub hash: String,
}

/// One protocol entry from the fee aggregator listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolSummary {
    pub name: String,
    #[serde(default)]
    pub chains: Vec<String>,
    #[serde(default)]
    pub change_1d: Option<f64>,
}

/// Blockchain read and submit API.
#[async_trait]
pub trait ChainSource: Send + Sync {
    async fn get_ledger_info(&self) -> OracleResult<LedgerInfo>;
    async fn get_account_resource(&self, address: &str, resource_type: &str) -> OracleResult<Value>;
    async fn get_account_transactions(&self, address: &str, limit: u32) -> OracleResult<Vec<AccountTransaction>>;
    async fn get_block_by_height(&self, height: u64) -> OracleResult<BlockInfo>;
    async fn submit_transaction(&self, signed: &Value) -> OracleResult<PendingTransaction>;
}

/// Simple-price oracle.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Look up a canonical token id (e.g. `aptos`).
    async fn get_price(&self, token_id: &str) -> OracleResult<TokenQuote>;
}

/// Protocol/fee aggregator listing.
#[async_trait]
pub trait FeeAggregatorSource: Send + Sync {
    async fn get_protocols(&self) -> OracleResult<Vec<ProtocolSummary>>;
}

/// Generic text-generation endpoint.
#[async_trait]
pub trait InferenceSource: Send + Sync {
    async fn generate(&self, prompt: &str) -> OracleResult<String>;
}

/// The full set of upstreams the oracle talks to.
#[derive(Clone)]
pub struct OracleDataSources {
    pub chain: Arc<dyn ChainSource>,
    pub prices: Arc<dyn PriceSource>,
    pub fees: Arc<dyn FeeAggregatorSource>,
    /// Absent when no inference endpoint is configured
    pub inference: Option<Arc<dyn InferenceSource>>,
}

impl OracleDataSources {
    /// Build reqwest-backed sources from configuration.
    pub fn from_config(config: &OracleConfig) -> OracleResult<Self> {
        let http_client = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("aptash-oracle/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| OracleError::Internal(format!("failed to build HTTP client: {}", e)))?;

        let inference = config.inference_api_key.as_ref().map(|key| {
            Arc::new(HuggingFaceClient::new(
                http_client.clone(),
                &config.inference_api_url,
                &config.inference_model,
                key,
            )) as Arc<dyn InferenceSource>
        });

        Ok(Self {
            chain: Arc::new(AptosNodeClient::new(http_client.clone(), &config.aptos_node_url)),
            prices: Arc::new(CoinGeckoClient::new(
                http_client.clone(),
                &config.price_api_url,
                config.price_api_key.clone(),
            )),
            fees: Arc::new(DefiLlamaClient::new(http_client, &config.fee_aggregator_url)),
            inference,
        })
    }
}

/// Send a request and decode a JSON body, mapping failures to typed errors.
async fn send_json<T: DeserializeOwned>(service: &str, request: RequestBuilder) -> OracleResult<T> {
    let response = request
        .send()
        .await
        .map_err(|e| OracleError::transport(service, e))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(OracleError::from_status(service, status, body));
    }

    response
        .json::<T>()
        .await
        .map_err(|e| OracleError::Decode(format!("{}: {}", service, e)))
}

fn trim_base(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

fn u64_from_str<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        Raw::Number(n) => Ok(n),
    }
}

fn value_u64(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

/// Extract the transferred APT amount from a coin transfer payload.
fn transfer_amount(payload: &Value) -> Option<f64> {
    let function = payload.get("function")?.as_str()?;
    if !function.ends_with("::transfer") && !function.ends_with("::transfer_coins") {
        return None;
    }
    let octas = payload.get("arguments")?.as_array()?.get(1).and_then(value_u64)?;
    Some(octas as f64 / OCTAS_PER_APT)
}

fn parse_account_transaction(raw: &Value) -> Option<AccountTransaction> {
    Some(AccountTransaction {
        version: raw.get("version").and_then(value_u64)?,
        timestamp_us: raw.get("timestamp").and_then(value_u64).unwrap_or(0),
        amount: raw.get("payload").and_then(transfer_amount),
    })
}

/// Aptos fullnode REST client.
pub struct AptosNodeClient {
    http_client: Client,
    base_url: String,
}

impl AptosNodeClient {
    pub fn new(http_client: Client, base_url: &str) -> Self {
        Self {
            http_client,
            base_url: trim_base(base_url),
        }
    }
}

#[async_trait]
impl ChainSource for AptosNodeClient {
    #[instrument(skip(self))]
    async fn get_ledger_info(&self) -> OracleResult<LedgerInfo> {
        send_json(CHAIN_NODE, self.http_client.get(&self.base_url)).await
    }

    #[instrument(skip(self), fields(address = %address))]
    async fn get_account_resource(&self, address: &str, resource_type: &str) -> OracleResult<Value> {
        let url = format!("{}/accounts/{}/resource/{}", self.base_url, address, resource_type);
        let resource: Value = send_json(CHAIN_NODE, self.http_client.get(url)).await?;
        Ok(resource.get("data").cloned().unwrap_or(Value::Null))
    }

    #[instrument(skip(self), fields(address = %address))]
    async fn get_account_transactions(&self, address: &str, limit: u32) -> OracleResult<Vec<AccountTransaction>> {
        let url = format!("{}/accounts/{}/transactions", self.base_url, address);
        let raw: Vec<Value> = send_json(
            CHAIN_NODE,
            self.http_client.get(url).query(&[("limit", limit.to_string())]),
        )
        .await?;

        let transactions: Vec<AccountTransaction> = raw.iter().filter_map(parse_account_transaction).collect();
        debug!("Fetched {} transactions for {}", transactions.len(), address);
        Ok(transactions)
    }

    #[instrument(skip(self))]
    async fn get_block_by_height(&self, height: u64) -> OracleResult<BlockInfo> {
        let url = format!("{}/blocks/by_height/{}", self.base_url, height);
        let raw: Value = send_json(
            CHAIN_NODE,
            self.http_client.get(url).query(&[("with_transactions", "true")]),
        )
        .await?;

        let transaction_count = match raw.get("transactions").and_then(Value::as_array) {
            Some(txs) => txs.len(),
            None => {
                let first = raw.get("first_version").and_then(value_u64).unwrap_or(0);
                let last = raw.get("last_version").and_then(value_u64).unwrap_or(first);
                (last.saturating_sub(first) + 1) as usize
            }
        };

        Ok(BlockInfo {
            block_height: raw.get("block_height").and_then(value_u64).unwrap_or(height),
            transaction_count,
        })
    }

    #[instrument(skip(self, signed))]
    async fn submit_transaction(&self, signed: &Value) -> OracleResult<PendingTransaction> {
        let url = format!("{}/transactions", self.base_url);
        send_json(CHAIN_NODE, self.http_client.post(url).json(signed)).await
    }
}

/// CoinGecko simple-price client.
pub struct CoinGeckoClient {
    http_client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl CoinGeckoClient {
    pub fn new(http_client: Client, base_url: &str, api_key: Option<String>) -> Self {
        Self {
            http_client,
            base_url: trim_base(base_url),
            api_key,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SimplePrice {
    usd: f64,
    #[serde(default)]
    usd_24h_change: Option<f64>,
}

#[async_trait]
impl PriceSource for CoinGeckoClient {
    #[instrument(skip(self), fields(token = %token_id))]
    async fn get_price(&self, token_id: &str) -> OracleResult<TokenQuote> {
        let mut request = self.http_client.get(format!("{}/simple/price", self.base_url)).query(&[
            ("ids", token_id),
            ("vs_currencies", "usd"),
            ("include_24hr_change", "true"),
        ]);
        if let Some(key) = &self.api_key {
            request = request.header("x-cg-demo-api-key", key);
        }

        let mut body: std::collections::HashMap<String, SimplePrice> = send_json(PRICE_ORACLE, request).await?;
        let price = body
            .remove(token_id)
            .ok_or_else(|| OracleError::Decode(format!("{}: no price for {}", PRICE_ORACLE, token_id)))?;

        Ok(TokenQuote {
            usd: price.usd,
            usd_24h_change: price.usd_24h_change.unwrap_or(0.0),
        })
    }
}

/// DefiLlama protocol listing client.
pub struct DefiLlamaClient {
    http_client: Client,
    base_url: String,
}

impl DefiLlamaClient {
    pub fn new(http_client: Client, base_url: &str) -> Self {
        Self {
            http_client,
            base_url: trim_base(base_url),
        }
    }
}

#[async_trait]
impl FeeAggregatorSource for DefiLlamaClient {
    #[instrument(skip(self))]
    async fn get_protocols(&self) -> OracleResult<Vec<ProtocolSummary>> {
        send_json(FEE_AGGREGATOR, self.http_client.get(format!("{}/protocols", self.base_url))).await
    }
}

/// Hugging Face style text-generation client.
pub struct HuggingFaceClient {
    http_client: Client,
    endpoint: String,
    api_key: String,
}

impl HuggingFaceClient {
    pub fn new(http_client: Client, base_url: &str, model: &str, api_key: &str) -> Self {
        Self {
            http_client,
            endpoint: format!("{}/{}", trim_base(base_url), model),
            api_key: api_key.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Generation {
    generated_text: String,
}

#[async_trait]
impl InferenceSource for HuggingFaceClient {
    #[instrument(skip(self, prompt))]
    async fn generate(&self, prompt: &str) -> OracleResult<String> {
        let body = serde_json::json!({
            "inputs": prompt,
            "parameters": { "max_new_tokens": 20, "return_full_text": false },
        });
        let request = self
            .http_client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body);

        let generations: Vec<Generation> = send_json(INFERENCE, request).await?;
        generations
            .into_iter()
            .next()
            .map(|g| g.generated_text)
            .ok_or_else(|| OracleError::PredictionParse("empty generation".to_string()))
    }
}
