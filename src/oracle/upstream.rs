//! Upstream client: paced, cached, degrade-gracefully lookups.
//!
//! Every lookup follows the same policy: fresh cache hit, else a paced fetch
//! through the resilience envelope, else the last stale value, else a fixed
//! fallback. Lookups therefore never fail. Transfer submission is the
//! exception and propagates its errors.

use crate::oracle::cache::ResponseCache;
use crate::oracle::data_sources::{
    AccountTransaction, OracleDataSources, PendingTransaction, CHAIN_NODE, FEE_AGGREGATOR, INFERENCE,
    PRICE_ORACLE,
};
use crate::oracle::error::{OracleError, OracleResult};
use crate::oracle::metrics::{
    OracleMetricsCollector, CACHE_HITS_TOTAL, FALLBACK_SERVED_TOTAL, STALE_SERVED_TOTAL,
};
use crate::oracle::rate_limit::UpstreamCadence;
use crate::oracle::resilience::ResilienceEnvelope;
use crate::oracle::scorer::BASE_FEE;
use crate::oracle::types::{DataOrigin, OracleConfig, ReputationRecord, Sourced, TokenQuote};
use chrono::Utc;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Transactions fetched per account when building a profile.
pub const HISTORY_LIMIT: u32 = 50;
/// Block transaction count treated as a fully loaded network.
const BLOCK_SATURATION_TXS: f64 = 100.0;
/// Network load assumed when the chain node cannot be reached.
pub const FALLBACK_NETWORK_LOAD: f64 = 0.5;
/// Protocols averaged for the historical fee estimate.
const FEE_HISTORY_PROTOCOLS: usize = 10;
const MICROS_PER_DAY: i64 = 86_400_000_000;

/// Map a user-facing symbol to the price oracle's canonical id.
pub fn canonical_token_id(symbol: &str) -> String {
    match symbol.trim().to_ascii_uppercase().as_str() {
        "APT" => "aptos".to_string(),
        "USDC" => "usd-coin".to_string(),
        "USDT" => "tether".to_string(),
        "BTC" => "bitcoin".to_string(),
        "ETH" => "ethereum".to_string(),
        _ => symbol.trim().to_lowercase(),
    }
}

/// Price served when the oracle has never answered for a token.
pub fn fallback_quote(token_id: &str) -> TokenQuote {
    let usd = match token_id {
        "aptos" => 8.0,
        "bitcoin" => 60_000.0,
        "ethereum" => 3_000.0,
        _ => 1.0,
    };
    TokenQuote { usd, usd_24h_change: 0.0 }
}

/// Score an account from its activity.
///
/// Neutral 0.5, raised by transaction volume and account age.
pub fn reputation_score(transaction_count: u64, account_age_days: u64) -> f64 {
    let mut score: f64 = 0.5;
    if transaction_count > 50 {
        score += 0.2;
    }
    if transaction_count > 100 {
        score += 0.1;
    }
    if account_age_days > 30 {
        score += 0.1;
    }
    if account_age_days > 90 {
        score += 0.1;
    }
    score.min(1.0)
}

/// What the oracle knows about an account.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountProfile {
    pub reputation: ReputationRecord,
    /// APT amounts of the account's recent outgoing transfers
    pub recent_amounts: Vec<f64>,
}

impl AccountProfile {
    /// Lowest-information profile: zero activity, neutral score.
    pub fn unknown(address: &str) -> Self {
        Self {
            reputation: ReputationRecord {
                address: address.to_string(),
                score: reputation_score(0, 0),
                transaction_count: 0,
                account_age_days: 0,
            },
            recent_amounts: Vec::new(),
        }
    }

    fn from_history(address: &str, sequence_number: u64, transactions: &[AccountTransaction]) -> Self {
        let transaction_count = sequence_number.max(transactions.len() as u64);
        let account_age_days = transactions
            .iter()
            .map(|tx| tx.timestamp_us)
            .filter(|ts| *ts > 0)
            .min()
            .map(|oldest| {
                let age_us = Utc::now().timestamp_micros() - oldest as i64;
                (age_us.max(0) / MICROS_PER_DAY) as u64
            })
            .unwrap_or(0);

        Self {
            reputation: ReputationRecord {
                address: address.to_string(),
                score: reputation_score(transaction_count, account_age_days),
                transaction_count,
                account_age_days,
            },
            recent_amounts: transactions.iter().filter_map(|tx| tx.amount).collect(),
        }
    }
}

/// Cached, paced access to every upstream.
pub struct UpstreamClient {
    sources: OracleDataSources,
    envelope: Arc<ResilienceEnvelope>,
    metrics: OracleMetricsCollector,
    chain_cadence: UpstreamCadence,
    price_cadence: UpstreamCadence,
    fee_cadence: UpstreamCadence,
    inference_cadence: UpstreamCadence,
    inference_timeout: Duration,
    prices: ResponseCache<TokenQuote>,
    network: ResponseCache<f64>,
    fee_history: ResponseCache<f64>,
    profiles: ResponseCache<AccountProfile>,
}

impl UpstreamClient {
    pub fn new(
        sources: OracleDataSources,
        envelope: Arc<ResilienceEnvelope>,
        metrics: OracleMetricsCollector,
        config: &OracleConfig,
    ) -> Self {
        let interval = config.upstream_min_interval();
        let ttl = config.cache_ttl();
        let max_entries = config.max_cache_entries;

        Self {
            sources,
            envelope,
            metrics,
            chain_cadence: UpstreamCadence::new(CHAIN_NODE, interval),
            price_cadence: UpstreamCadence::new(PRICE_ORACLE, interval),
            fee_cadence: UpstreamCadence::new(FEE_AGGREGATOR, interval),
            inference_cadence: UpstreamCadence::new(INFERENCE, interval),
            inference_timeout: config.inference_timeout(),
            prices: ResponseCache::new("token_price", ttl, max_entries),
            network: ResponseCache::new("network_load", ttl, max_entries),
            fee_history: ResponseCache::new("historical_fee", ttl, max_entries),
            profiles: ResponseCache::new("reputation", ttl, max_entries),
        }
    }

    /// Current USD price and 24h change for a token symbol.
    #[instrument(skip(self), fields(symbol = %symbol))]
    pub async fn token_price(&self, symbol: &str) -> Sourced<TokenQuote> {
        let token_id = canonical_token_id(symbol);
        let key = ResponseCache::<TokenQuote>::key("token_price", &[token_id.as_str()]);
        let prices = &self.sources.prices;
        let id = token_id.as_str();

        self.lookup(PRICE_ORACLE, &self.prices, &key, fallback_quote(id), &self.price_cadence, move || {
            prices.get_price(id)
        })
        .await
    }

    /// Network congestion in [0, 1] from the latest block's transaction count.
    #[instrument(skip(self))]
    pub async fn network_load(&self) -> Sourced<f64> {
        let key = ResponseCache::<f64>::key("network_load", &[]);
        let chain = &self.sources.chain;

        self.lookup(CHAIN_NODE, &self.network, &key, FALLBACK_NETWORK_LOAD, &self.chain_cadence, move || async move {
            let ledger = chain.get_ledger_info().await?;
            let block = chain.get_block_by_height(ledger.block_height).await?;
            debug!("Block {} carried {} transactions", block.block_height, block.transaction_count);
            Ok((block.transaction_count as f64 / BLOCK_SATURATION_TXS).clamp(0.0, 1.0))
        })
        .await
    }

    /// Historical mean fee from recent aggregator activity on the chain.
    #[instrument(skip(self))]
    pub async fn historical_mean_fee(&self) -> Sourced<f64> {
        let key = ResponseCache::<f64>::key("historical_fee", &["aptos"]);
        let fees = &self.sources.fees;

        self.lookup(FEE_AGGREGATOR, &self.fee_history, &key, BASE_FEE, &self.fee_cadence, move || async move {
            let protocols = fees.get_protocols().await?;
            let changes: Vec<f64> = protocols
                .iter()
                .filter(|p| p.chains.iter().any(|c| c.eq_ignore_ascii_case("aptos")))
                .filter_map(|p| p.change_1d)
                .filter(|c| c.is_finite())
                .take(FEE_HISTORY_PROTOCOLS)
                .collect();

            if changes.is_empty() {
                return Ok(BASE_FEE);
            }
            let mean_change = changes.iter().map(|c| c.abs()).sum::<f64>() / changes.len() as f64;
            Ok(BASE_FEE * (1.0 + mean_change.min(100.0) / 100.0))
        })
        .await
    }

    /// Reputation and recent transfer amounts for an account.
    #[instrument(skip(self), fields(address = %address))]
    pub async fn account_profile(&self, address: &str) -> Sourced<AccountProfile> {
        let key = ResponseCache::<AccountProfile>::key("reputation", &[address]);
        let chain = &self.sources.chain;

        self.lookup(
            CHAIN_NODE,
            &self.profiles,
            &key,
            AccountProfile::unknown(address),
            &self.chain_cadence,
            move || async move {
                let (account, transactions) = tokio::try_join!(
                    chain.get_account_resource(address, "0x1::account::Account"),
                    chain.get_account_transactions(address, HISTORY_LIMIT),
                )?;
                let sequence_number = account
                    .get("sequence_number")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                Ok(AccountProfile::from_history(address, sequence_number, &transactions))
            },
        )
        .await
    }

    /// Ask the inference endpoint for a completion, when one is configured.
    ///
    /// Never retried, and bounded by the inference budget rather than the
    /// request timeout: the refinement is optional and must not stretch
    /// latency.
    pub async fn infer(&self, prompt: &str) -> OracleResult<String> {
        let inference = self.sources.inference.as_ref().ok_or_else(|| OracleError::UpstreamUnavailable {
            service: INFERENCE.to_string(),
            message: "no inference endpoint configured".to_string(),
            status: None,
        })?;
        let cadence = &self.inference_cadence;

        self.envelope
            .execute_once_within(INFERENCE, self.inference_timeout, move || async move {
                cadence.wait().await;
                inference.generate(prompt).await
            })
            .await
    }

    pub fn inference_available(&self) -> bool {
        self.sources.inference.is_some()
    }

    /// Forward a signed transaction to the node. Errors propagate unchanged.
    pub async fn submit_transaction(&self, signed: &Value) -> OracleResult<PendingTransaction> {
        self.chain_cadence.wait().await;
        self.sources.chain.submit_transaction(signed).await
    }

    async fn lookup<T, F, Fut>(
        &self,
        service: &str,
        cache: &ResponseCache<T>,
        key: &str,
        fallback: T,
        cadence: &UpstreamCadence,
        fetch: F,
    ) -> Sourced<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = OracleResult<T>>,
    {
        if let Some(value) = cache.get(key).await {
            self.metrics.increment_counter(CACHE_HITS_TOTAL).await;
            return Sourced::new(value, DataOrigin::Cached);
        }

        let mut fetch = fetch;
        let result = self
            .envelope
            .execute(service, move || {
                let attempt = fetch();
                async move {
                    cadence.wait().await;
                    attempt.await
                }
            })
            .await;

        match result {
            Ok(value) => {
                cache.set(key, value.clone()).await;
                Sourced::new(value, DataOrigin::Live)
            }
            Err(err) => {
                if let Some(stale) = cache.get_stale(key).await {
                    warn!("{} failed for {} ({}), serving stale value", service, key, err);
                    self.metrics.increment_counter(STALE_SERVED_TOTAL).await;
                    return Sourced::new(stale, DataOrigin::Stale);
                }
                match err {
                    OracleError::UpstreamRateLimited { .. } => {
                        warn!("{} rate limited {} with nothing cached, serving fallback", service, key)
                    }
                    other => warn!("{} failed for {} ({}), serving fallback", service, key, other),
                }
                self.metrics.increment_counter(FALLBACK_SERVED_TOTAL).await;
                Sourced::new(fallback, DataOrigin::Fallback)
            }
        }
    }
}
