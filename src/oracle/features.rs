//! Featurization stage.
//!
//! Gathers upstream signals into flat feature records. Independent lookups
//! are issued concurrently so a request waits for the slowest one, not the sum.

use crate::oracle::data_sources::{CHAIN_NODE, FEE_AGGREGATOR, PRICE_ORACLE};
use crate::oracle::types::{
    DataSource, FeeFeatures, FraudFeatures, MarketContext, PatternAnalysis, PatternLabel,
};
use crate::oracle::upstream::UpstreamClient;
use crate::types::{FeeRequest, FraudRequest};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Prior transfers needed before an account is judged on its history.
const MIN_HISTORY: usize = 5;
/// Multiple of the historical maximum that counts as unusually large.
const LARGE_VS_MAX: f64 = 5.0;
/// Relative deviation from the historical mean that counts as unusual.
const UNUSUAL_DEVIATION: f64 = 10.0;
/// Token amount below which a transfer counts as a micro transaction.
pub const MICRO_TRANSACTION_AMOUNT: f64 = 0.001;

/// Compare a requested amount with an account's recent transfer amounts.
pub fn analyze_pattern(amount: f64, history: &[f64]) -> PatternAnalysis {
    if history.is_empty() {
        return PatternAnalysis {
            label: PatternLabel::NoHistory,
            risk_contribution: 0.3,
            historical_average: None,
            deviation: None,
        };
    }

    let mean = history.iter().sum::<f64>() / history.len() as f64;
    let max = history.iter().cloned().fold(f64::MIN, f64::max);
    let deviation = if mean > 0.0 { (amount - mean).abs() / mean } else { 0.0 };

    let (label, risk_contribution) = if amount > max * LARGE_VS_MAX {
        (PatternLabel::UnusuallyLarge, 0.9)
    } else if deviation > UNUSUAL_DEVIATION {
        (PatternLabel::UnusualAmount, 0.8)
    } else if history.len() < MIN_HISTORY {
        (PatternLabel::NewAccount, 0.4)
    } else {
        (PatternLabel::Normal, 0.1)
    };

    PatternAnalysis {
        label,
        risk_contribution,
        historical_average: Some(mean),
        deviation: Some(deviation),
    }
}

/// Market context for an amount at a given price.
pub fn market_context(amount: f64, price_usd: f64, change_24h_pct: f64, large_threshold_usd: f64) -> MarketContext {
    let usd_value = amount * price_usd;
    MarketContext {
        usd_value,
        is_large: usd_value > large_threshold_usd,
        is_micro: amount < MICRO_TRANSACTION_AMOUNT,
        volatility_pct: change_24h_pct.abs(),
    }
}

/// Feature computer responsible for turning requests into feature records.
pub struct FeatureComputer {
    upstream: Arc<UpstreamClient>,
    large_transaction_usd: f64,
}

impl FeatureComputer {
    pub fn new(upstream: Arc<UpstreamClient>, large_transaction_usd: f64) -> Self {
        Self {
            upstream,
            large_transaction_usd,
        }
    }

    /// Fee features: network load, token price and historical fee, fetched concurrently.
    #[instrument(skip(self), fields(token = %request.token))]
    pub async fn fee_features(&self, request: &FeeRequest) -> (FeeFeatures, Vec<DataSource>) {
        let (load, quote, mean_fee) = tokio::join!(
            self.upstream.network_load(),
            self.upstream.token_price(&request.token),
            self.upstream.historical_mean_fee(),
        );

        let features = FeeFeatures {
            amount: request.amount,
            token_price_usd: quote.value.usd,
            token_price_24h_change_pct: quote.value.usd_24h_change,
            network_load: load.value,
            priority: request.priority,
            historical_mean_fee: mean_fee.value,
        };
        let sources = vec![
            DataSource::new(CHAIN_NODE, load.origin),
            DataSource::new(PRICE_ORACLE, quote.origin),
            DataSource::new(FEE_AGGREGATOR, mean_fee.origin),
        ];

        debug!("Computed fee features: {:?}", features);
        (features, sources)
    }

    /// Fraud features: both reputations and the price, fetched concurrently.
    #[instrument(skip(self), fields(sender = %request.sender))]
    pub async fn fraud_features(&self, request: &FraudRequest) -> (FraudFeatures, Vec<DataSource>) {
        let (sender, recipient, quote) = tokio::join!(
            self.upstream.account_profile(&request.sender),
            self.upstream.account_profile(&request.recipient),
            self.upstream.token_price("APT"),
        );

        let pattern_analysis = analyze_pattern(request.amount, &sender.value.recent_amounts);
        let market = market_context(
            request.amount,
            quote.value.usd,
            quote.value.usd_24h_change,
            self.large_transaction_usd,
        );

        let sources = vec![
            DataSource::new("sender_reputation", sender.origin),
            DataSource::new("recipient_reputation", recipient.origin),
            DataSource::new(PRICE_ORACLE, quote.origin),
        ];
        let features = FraudFeatures {
            sender: request.sender.clone(),
            recipient: request.recipient.clone(),
            amount: request.amount,
            timestamp: request.timestamp,
            sender_reputation: sender.value.reputation,
            recipient_reputation: recipient.value.reputation,
            pattern_analysis,
            market_context: market,
        };

        debug!(
            "Computed fraud features: pattern={} usd_value={:.2}",
            features.pattern_analysis.label.as_str(),
            features.market_context.usd_value
        );
        (features, sources)
    }
}
