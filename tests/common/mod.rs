//! In-process fake upstreams shared by the integration tests.

#![allow(dead_code)]

use aptash_oracle::oracle::data_sources::{
    AccountTransaction, BlockInfo, ChainSource, FeeAggregatorSource, InferenceSource, LedgerInfo,
    OracleDataSources, PendingTransaction, PriceSource, ProtocolSummary,
};
use aptash_oracle::oracle::error::{OracleError, OracleResult};
use aptash_oracle::oracle::types::TokenQuote;
use aptash_oracle::OracleBuilder;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How a fake upstream answers.
#[derive(Debug, Clone)]
pub enum Mode<T> {
    Ok(T),
    RateLimited,
    Down,
}

fn answer<T: Clone>(service: &str, mode: &Mode<T>) -> OracleResult<T> {
    match mode {
        Mode::Ok(value) => Ok(value.clone()),
        Mode::RateLimited => Err(OracleError::UpstreamRateLimited {
            service: service.to_string(),
        }),
        Mode::Down => Err(OracleError::UpstreamUnavailable {
            service: service.to_string(),
            message: "status 503: unavailable".to_string(),
            status: Some(503),
        }),
    }
}

pub struct FakeChain {
    pub block_txs: Mutex<Mode<usize>>,
    pub histories: Mutex<HashMap<String, Vec<f64>>>,
    pub submit: Mutex<Mode<String>>,
    pub submit_calls: AtomicU32,
}

impl FakeChain {
    pub fn healthy() -> Self {
        Self {
            block_txs: Mutex::new(Mode::Ok(30)),
            histories: Mutex::new(HashMap::new()),
            submit: Mutex::new(Mode::Ok("0xfeed".to_string())),
            submit_calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ChainSource for FakeChain {
    async fn get_ledger_info(&self) -> OracleResult<LedgerInfo> {
        Ok(LedgerInfo {
            chain_id: 1,
            ledger_version: 1_000_000,
            block_height: 5_000,
            ledger_timestamp: 0,
        })
    }

    async fn get_account_resource(&self, _address: &str, _resource_type: &str) -> OracleResult<Value> {
        Ok(json!({ "sequence_number": "10" }))
    }

    async fn get_account_transactions(&self, address: &str, _limit: u32) -> OracleResult<Vec<AccountTransaction>> {
        let histories = self.histories.lock().unwrap();
        Ok(histories
            .get(address)
            .map(|amounts| {
                amounts
                    .iter()
                    .enumerate()
                    .map(|(i, amount)| AccountTransaction {
                        version: i as u64,
                        timestamp_us: 0,
                        amount: Some(*amount),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_block_by_height(&self, height: u64) -> OracleResult<BlockInfo> {
        let mode = self.block_txs.lock().unwrap().clone();
        answer("chain_node", &mode).map(|transaction_count| BlockInfo {
            block_height: height,
            transaction_count,
        })
    }

    async fn submit_transaction(&self, _signed: &Value) -> OracleResult<PendingTransaction> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        let mode = self.submit.lock().unwrap().clone();
        answer("chain_node", &mode).map(|hash| PendingTransaction { hash })
    }
}

pub struct FakePrices {
    pub mode: Mutex<Mode<f64>>,
    pub calls: AtomicU32,
}

impl FakePrices {
    pub fn at(usd: f64) -> Self {
        Self {
            mode: Mutex::new(Mode::Ok(usd)),
            calls: AtomicU32::new(0),
        }
    }

    pub fn set(&self, mode: Mode<f64>) {
        *self.mode.lock().unwrap() = mode;
    }
}

#[async_trait]
impl PriceSource for FakePrices {
    async fn get_price(&self, _token_id: &str) -> OracleResult<TokenQuote> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mode = self.mode.lock().unwrap().clone();
        answer("price_oracle", &mode).map(|usd| TokenQuote {
            usd,
            usd_24h_change: 2.0,
        })
    }
}

pub struct FakeFees;

#[async_trait]
impl FeeAggregatorSource for FakeFees {
    async fn get_protocols(&self) -> OracleResult<Vec<ProtocolSummary>> {
        Ok(vec![
            ProtocolSummary {
                name: "Thala".to_string(),
                chains: vec!["Aptos".to_string()],
                change_1d: Some(4.0),
            },
            ProtocolSummary {
                name: "Uniswap".to_string(),
                chains: vec!["Ethereum".to_string()],
                change_1d: Some(90.0),
            },
        ])
    }
}

pub struct FakeInference {
    pub reply: Mutex<Mode<String>>,
    /// Sleep this long before answering
    pub delay: Mutex<Option<Duration>>,
    pub calls: AtomicU32,
}

impl FakeInference {
    pub fn replying(text: &str) -> Self {
        Self {
            reply: Mutex::new(Mode::Ok(text.to_string())),
            delay: Mutex::new(None),
            calls: AtomicU32::new(0),
        }
    }

    /// An endpoint that accepts the call and never answers in time.
    pub fn hanging() -> Self {
        let inference = Self::replying("0.002");
        *inference.delay.lock().unwrap() = Some(Duration::from_secs(3600));
        inference
    }
}

#[async_trait]
impl InferenceSource for FakeInference {
    async fn generate(&self, _prompt: &str) -> OracleResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mode = self.reply.lock().unwrap().clone();
        answer("inference", &mode)
    }
}

/// Fakes plus the source bundle wired over them.
pub struct Harness {
    pub chain: Arc<FakeChain>,
    pub prices: Arc<FakePrices>,
    pub inference: Option<Arc<FakeInference>>,
}

impl Harness {
    pub fn healthy() -> Self {
        Self {
            chain: Arc::new(FakeChain::healthy()),
            prices: Arc::new(FakePrices::at(8.5)),
            inference: None,
        }
    }

    pub fn with_inference(mut self, inference: FakeInference) -> Self {
        self.inference = Some(Arc::new(inference));
        self
    }

    pub fn sources(&self) -> OracleDataSources {
        OracleDataSources {
            chain: self.chain.clone(),
            prices: self.prices.clone(),
            fees: Arc::new(FakeFees),
            inference: self
                .inference
                .clone()
                .map(|inference| inference as Arc<dyn InferenceSource>),
        }
    }
}

/// Builder with pacing disabled and fast retries.
pub fn test_builder() -> OracleBuilder {
    OracleBuilder::new()
        .with_upstream_min_interval(0)
        .with_retry(2, 10)
        .with_request_timeout(1_000)
}

pub const ALICE: &str = "0x00000000000000000000000000000000000000000000000000000000000a11ce";
pub const BOB: &str = "0x0000000000000000000000000000000000000000000000000000000000000b0b";
