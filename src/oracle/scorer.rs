//! Prediction engine - turns feature records into fee and risk predictions.
//!
//! Two strategies implement [`PredictionStrategy`]: a deterministic closed
//! form, and an inference-refined variant that asks the text-generation
//! endpoint for a better number and silently keeps the closed-form answer
//! whenever the endpoint fails or says something unparsable.

use crate::oracle::error::{OracleError, OracleResult};
use crate::oracle::metrics::{OracleMetricsCollector, INFERENCE_REFINED_TOTAL};
use crate::oracle::types::{DataSource, FeeFeatures, FeePrediction, FraudFeatures, FraudPrediction};
use crate::oracle::upstream::UpstreamClient;
use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Base network fee in APT.
pub const BASE_FEE: f64 = 0.001;
/// Floor for any predicted fee.
pub const MIN_FEE: f64 = 0.0001;
pub const CLOSED_FORM_FEE_CONFIDENCE: f64 = 0.75;
pub const REFINED_FEE_CONFIDENCE: f64 = 0.85;
pub const RULE_BASED_RISK_CONFIDENCE: f64 = 0.8;
pub const REFINED_RISK_CONFIDENCE: f64 = 0.85;

const BASE_RISK: f64 = 0.3;
const LOW_REPUTATION: f64 = 0.3;
const HIGH_PATTERN_RISK: f64 = 0.7;
/// Amounts frequently used in scripted fraud.
const ROUND_AMOUNTS: [f64; 5] = [1_000.0, 5_000.0, 10_000.0, 50_000.0, 100_000.0];
const FUTURE_TOLERANCE_SECS: i64 = 300;
const STALE_AFTER_SECS: i64 = 30 * 86_400;
/// Largest base fee accepted from the inference endpoint.
const MAX_REFINED_BASE_FEE: f64 = BASE_FEE * 100.0;

/// Fee answer from a strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct FeeEstimate {
    pub fee: f64,
    pub confidence: f64,
    pub model: String,
    pub factors: HashMap<String, f64>,
}

/// Risk answer from a strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskAssessment {
    pub risk_score: f64,
    pub confidence: f64,
    pub model: String,
    pub risk_factors: Vec<String>,
}

/// A way of producing predictions from features.
#[async_trait]
pub trait PredictionStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    async fn estimate_fee(&self, features: &FeeFeatures) -> OracleResult<FeeEstimate>;
    async fn assess_risk(&self, features: &FraudFeatures) -> OracleResult<RiskAssessment>;
}

/// Fee from a base fee, before the floor is applied.
fn fee_from_base(base: f64, features: &FeeFeatures) -> f64 {
    let amount_factor = 1.0 + (features.amount.max(0.0) + 1.0).ln() / 10.0;
    base * features.priority.multiplier() * amount_factor
}

/// Closed-form fee in APT.
pub fn closed_form_fee(features: &FeeFeatures) -> f64 {
    let base = BASE_FEE * (1.0 + features.network_load.clamp(0.0, 1.0));
    fee_from_base(base, features).max(MIN_FEE)
}

/// Timing risk of a caller-supplied unix timestamp, evaluated at `now`.
pub fn timing_risk(timestamp: i64, now: i64) -> f64 {
    if timestamp > now + FUTURE_TOLERANCE_SECS {
        return 0.3;
    }
    if now - timestamp > STALE_AFTER_SECS {
        return 0.2;
    }
    match DateTime::<Utc>::from_timestamp(timestamp, 0) {
        Some(at) if at.hour() < 5 => 0.1,
        _ => 0.0,
    }
}

/// Same length, different, and at most two characters apart.
pub fn addresses_similar(a: &str, b: &str) -> bool {
    if a == b || a.len() != b.len() {
        return false;
    }
    a.chars().zip(b.chars()).filter(|(x, y)| x != y).count() <= 2
}

/// First numeric token in a piece of generated text.
pub fn parse_first_number(text: &str) -> OracleResult<f64> {
    text.split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .filter(|token| token.chars().any(|c| c.is_ascii_digit()))
        .find_map(|token| token.trim_matches('.').parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .ok_or_else(|| OracleError::PredictionParse(format!("no number in {:?}", text)))
}

/// Coarse risk direction read from generated text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskSignal {
    High,
    Low,
}

impl RiskSignal {
    /// Adjustment applied on top of the rule-based score.
    pub fn nudge(&self) -> f64 {
        match self {
            RiskSignal::High => 0.15,
            RiskSignal::Low => -0.1,
        }
    }
}

pub fn parse_risk_signal(text: &str) -> OracleResult<RiskSignal> {
    let lowered = text.to_lowercase();
    let high = ["high", "suspicious", "fraud"].iter().any(|w| lowered.contains(w));
    let low = ["low", "safe", "legit"].iter().any(|w| lowered.contains(w));
    match (high, low) {
        (true, false) => Ok(RiskSignal::High),
        (false, true) => Ok(RiskSignal::Low),
        _ => Err(OracleError::PredictionParse(format!("no clear risk signal in {:?}", text))),
    }
}

/// Deterministic strategy; always available.
#[derive(Debug, Clone, Default)]
pub struct ClosedForm;

impl ClosedForm {
    fn fee(&self, features: &FeeFeatures) -> FeeEstimate {
        let mut factors = HashMap::new();
        factors.insert("base_fee".to_string(), BASE_FEE);
        factors.insert("network_load".to_string(), features.network_load);
        factors.insert("priority_multiplier".to_string(), features.priority.multiplier());
        factors.insert("amount_factor".to_string(), 1.0 + (features.amount + 1.0).ln() / 10.0);
        factors.insert("token_price_usd".to_string(), features.token_price_usd);
        factors.insert("historical_mean_fee".to_string(), features.historical_mean_fee);

        FeeEstimate {
            fee: closed_form_fee(features),
            confidence: CLOSED_FORM_FEE_CONFIDENCE,
            model: self.name().to_string(),
            factors,
        }
    }

    fn risk(&self, features: &FraudFeatures, now: i64) -> RiskAssessment {
        let mut risk = BASE_RISK;
        let mut factors = Vec::new();
        let mut add = |delta: f64, factor: &str| {
            risk += delta;
            factors.push(factor.to_string());
        };

        if features.sender_reputation.score < LOW_REPUTATION {
            add(0.3, "low_sender_reputation");
        }
        if features.recipient_reputation.score < LOW_REPUTATION {
            add(0.2, "low_recipient_reputation");
        }
        if features.pattern_analysis.risk_contribution > HIGH_PATTERN_RISK {
            add(0.3, &format!("pattern_{}", features.pattern_analysis.label.as_str()));
        }
        if features.market_context.is_large {
            add(0.2, "large_transaction");
        }
        if features.sender == features.recipient {
            add(0.3, "self_transaction");
        }
        if ROUND_AMOUNTS.contains(&features.amount) {
            add(0.1, "round_amount");
        }
        if addresses_similar(&features.sender, &features.recipient) {
            add(0.2, "similar_addresses");
        }
        if let Some(timestamp) = features.timestamp {
            let timing = timing_risk(timestamp, now);
            if timing > 0.0 {
                add(timing, "unusual_timing");
            }
        }
        if features.market_context.is_micro {
            add(0.15, "micro_transaction");
        }

        RiskAssessment {
            risk_score: risk.clamp(0.0, 1.0),
            confidence: RULE_BASED_RISK_CONFIDENCE,
            model: "rule_based_analysis".to_string(),
            risk_factors: factors,
        }
    }
}

#[async_trait]
impl PredictionStrategy for ClosedForm {
    fn name(&self) -> &'static str {
        "closed_form"
    }

    async fn estimate_fee(&self, features: &FeeFeatures) -> OracleResult<FeeEstimate> {
        Ok(self.fee(features))
    }

    async fn assess_risk(&self, features: &FraudFeatures) -> OracleResult<RiskAssessment> {
        Ok(self.risk(features, Utc::now().timestamp()))
    }
}

/// Strategy that refines the closed form with the inference endpoint.
pub struct InferenceRefined {
    upstream: Arc<UpstreamClient>,
    metrics: OracleMetricsCollector,
    closed_form: ClosedForm,
}

impl InferenceRefined {
    pub fn new(upstream: Arc<UpstreamClient>, metrics: OracleMetricsCollector) -> Self {
        Self {
            upstream,
            metrics,
            closed_form: ClosedForm,
        }
    }

    /// Base fee suggested by the endpoint, before priority and amount scaling.
    async fn refined_base_fee(&self, features: &FeeFeatures) -> OracleResult<f64> {
        let prompt = format!(
            "Aptos network load {:.2}, APT price ${:.2} ({:+.2}% 24h), recent mean fee {:.6} APT. \
             Base transaction fee in APT:",
            features.network_load,
            features.token_price_usd,
            features.token_price_24h_change_pct,
            features.historical_mean_fee,
        );
        let text = self.upstream.infer(&prompt).await?;
        let base = parse_first_number(&text)?;
        if !(MIN_FEE..=MAX_REFINED_BASE_FEE).contains(&base) {
            return Err(OracleError::PredictionParse(format!("base fee {} out of range", base)));
        }
        Ok(base)
    }

    async fn risk_signal(&self, features: &FraudFeatures, rule_score: f64) -> OracleResult<RiskSignal> {
        let prompt = format!(
            "Transfer of {:.4} APT (${:.2}) from an account with reputation {:.2} to one with \
             reputation {:.2}; history pattern {}; rule score {:.2}. Fraud risk (high or low):",
            features.amount,
            features.market_context.usd_value,
            features.sender_reputation.score,
            features.recipient_reputation.score,
            features.pattern_analysis.label.as_str(),
            rule_score,
        );
        let text = self.upstream.infer(&prompt).await?;
        parse_risk_signal(&text)
    }
}

#[async_trait]
impl PredictionStrategy for InferenceRefined {
    fn name(&self) -> &'static str {
        "inference_refined"
    }

    #[instrument(skip(self, features))]
    async fn estimate_fee(&self, features: &FeeFeatures) -> OracleResult<FeeEstimate> {
        let mut estimate = self.closed_form.fee(features);
        match self.refined_base_fee(features).await {
            Ok(base) => {
                estimate.fee = fee_from_base(base, features).max(MIN_FEE);
                estimate.confidence = REFINED_FEE_CONFIDENCE;
                estimate.model = self.name().to_string();
                estimate.factors.insert("refined_base_fee".to_string(), base);
                self.metrics.increment_counter(INFERENCE_REFINED_TOTAL).await;
            }
            Err(err) => debug!("Keeping closed-form fee: {}", err),
        }
        Ok(estimate)
    }

    #[instrument(skip(self, features))]
    async fn assess_risk(&self, features: &FraudFeatures) -> OracleResult<RiskAssessment> {
        let mut assessment = self.closed_form.risk(features, Utc::now().timestamp());
        match self.risk_signal(features, assessment.risk_score).await {
            Ok(signal) => {
                assessment.risk_score = (assessment.risk_score + signal.nudge()).clamp(0.0, 1.0);
                assessment.confidence = REFINED_RISK_CONFIDENCE;
                assessment.model = "rule_based_analysis+inference".to_string();
                if signal == RiskSignal::High {
                    assessment.risk_factors.push("inference_flagged".to_string());
                }
                self.metrics.increment_counter(INFERENCE_REFINED_TOTAL).await;
            }
            Err(err) => debug!("Keeping rule-based risk: {}", err),
        }
        Ok(assessment)
    }
}

/// Picks a strategy and assembles prediction results.
pub struct PredictionEngine {
    closed_form: ClosedForm,
    refined: Option<InferenceRefined>,
}

impl PredictionEngine {
    pub fn closed_form_only() -> Self {
        Self {
            closed_form: ClosedForm,
            refined: None,
        }
    }

    /// Use the inference endpoint when the upstream client has one.
    pub fn new(upstream: Arc<UpstreamClient>, metrics: OracleMetricsCollector) -> Self {
        let refined = upstream
            .inference_available()
            .then(|| InferenceRefined::new(upstream, metrics));
        Self {
            closed_form: ClosedForm,
            refined,
        }
    }

    pub fn strategy(&self) -> &dyn PredictionStrategy {
        match &self.refined {
            Some(refined) => refined as &dyn PredictionStrategy,
            None => &self.closed_form as &dyn PredictionStrategy,
        }
    }

    pub async fn predict_fee(&self, features: &FeeFeatures, data_sources: Vec<DataSource>) -> OracleResult<FeePrediction> {
        let estimate = self.strategy().estimate_fee(features).await?;
        if !estimate.fee.is_finite() || estimate.fee < 0.0 {
            return Err(OracleError::Internal(format!("non-finite fee {}", estimate.fee)));
        }

        Ok(FeePrediction {
            predicted_fee: estimate.fee,
            currency: "APT".to_string(),
            confidence: estimate.confidence.clamp(0.0, 1.0),
            model: estimate.model,
            contributing_factors: estimate.factors,
            data_sources,
            produced_at: Utc::now(),
        })
    }

    pub async fn predict_fraud(
        &self,
        features: &FraudFeatures,
        data_sources: Vec<DataSource>,
    ) -> OracleResult<FraudPrediction> {
        let assessment = self.strategy().assess_risk(features).await?;
        let analysis = serde_json::json!({
            "amount": features.amount,
            "usd_value": features.market_context.usd_value,
            "sender_reputation": features.sender_reputation.score,
            "recipient_reputation": features.recipient_reputation.score,
            "pattern": features.pattern_analysis.label,
            "deviation": features.pattern_analysis.deviation,
            "volatility_pct": features.market_context.volatility_pct,
            "timestamp": features.timestamp,
        });

        Ok(FraudPrediction {
            risk_score: assessment.risk_score,
            confidence: assessment.confidence.clamp(0.0, 1.0),
            model: assessment.model,
            risk_factors: assessment.risk_factors,
            analysis,
            data_sources,
            produced_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::features::{analyze_pattern, market_context};
    use crate::oracle::types::ReputationRecord;
    use crate::types::Priority;

    fn fee_features(amount: f64, load: f64, priority: Priority) -> FeeFeatures {
        FeeFeatures {
            amount,
            token_price_usd: 8.0,
            token_price_24h_change_pct: 1.0,
            network_load: load,
            priority,
            historical_mean_fee: BASE_FEE,
        }
    }

    fn reputation(address: &str, score: f64) -> ReputationRecord {
        ReputationRecord {
            address: address.to_string(),
            score,
            transaction_count: 0,
            account_age_days: 0,
        }
    }

    fn fraud_features(sender: &str, recipient: &str, amount: f64) -> FraudFeatures {
        FraudFeatures {
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            amount,
            timestamp: None,
            sender_reputation: reputation(sender, 0.5),
            recipient_reputation: reputation(recipient, 0.5),
            pattern_analysis: analyze_pattern(amount, &[]),
            market_context: market_context(amount, 1.0, 0.0, 1_000_000.0),
        }
    }

    const A: &str = "0x00000000000000000000000000000000000000000000000000000000000000aa";
    const B: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";

    #[test]
    fn test_closed_form_fee_formula() {
        let fee = closed_form_fee(&fee_features(500.0, 0.5, Priority::Normal));
        let expected = 0.001 * 1.5 * 1.0 * (1.0 + (501.0f64).ln() / 10.0);
        assert!((fee - expected).abs() < 1e-12);
    }

    #[test]
    fn test_fee_priority_monotonic() {
        for amount in [0.01, 1.0, 500.0, 1e6] {
            let low = closed_form_fee(&fee_features(amount, 0.3, Priority::Low));
            let normal = closed_form_fee(&fee_features(amount, 0.3, Priority::Normal));
            let high = closed_form_fee(&fee_features(amount, 0.3, Priority::High));
            assert!(high >= normal && normal >= low, "amount {}", amount);
        }
    }

    #[test]
    fn test_fee_floor() {
        let fee = closed_form_fee(&fee_features(0.0, 0.0, Priority::Low));
        assert!(fee >= MIN_FEE);
    }

    #[test]
    fn test_parse_first_number() {
        assert_eq!(parse_first_number("The fee is 0.0023 APT.").unwrap(), 0.0023);
        assert_eq!(parse_first_number("about 12 or 13").unwrap(), 12.0);
        assert!(matches!(parse_first_number("no idea"), Err(OracleError::PredictionParse(_))));
        assert!(parse_first_number("...").is_err());
    }

    #[test]
    fn test_parse_risk_signal() {
        assert_eq!(parse_risk_signal("This looks HIGH risk").unwrap(), RiskSignal::High);
        assert_eq!(parse_risk_signal("low").unwrap(), RiskSignal::Low);
        assert!(parse_risk_signal("high or low, hard to say").is_err());
        assert!(parse_risk_signal("banana").is_err());
    }

    #[test]
    fn test_self_transfer_and_round_amount_are_additive() {
        let strategy = ClosedForm;
        let now = Utc::now().timestamp();

        let plain = strategy.risk(&fraud_features(A, B, 999.0), now).risk_score;
        let self_only = strategy.risk(&fraud_features(A, A, 999.0), now).risk_score;
        let round_only = strategy.risk(&fraud_features(A, B, 1000.0), now).risk_score;
        let both = strategy.risk(&fraud_features(A, A, 1000.0), now).risk_score;

        assert!((plain - 0.3).abs() < 1e-9);
        assert!((self_only - plain - 0.3).abs() < 1e-9);
        assert!((round_only - plain - 0.1).abs() < 1e-9);
        assert!((both - plain - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_reputation_and_large_contributions() {
        let mut features = fraud_features(A, B, 50.0);
        features.sender_reputation.score = 0.1;
        features.recipient_reputation.score = 0.2;
        features.market_context.is_large = true;

        let assessment = ClosedForm.risk(&features, Utc::now().timestamp());
        assert_eq!(assessment.risk_score, 1.0);
        assert!(assessment.risk_factors.contains(&"low_sender_reputation".to_string()));
        assert!(assessment.risk_factors.contains(&"low_recipient_reputation".to_string()));
        assert!(assessment.risk_factors.contains(&"large_transaction".to_string()));
    }

    #[test]
    fn test_micro_transaction_contribution() {
        let now = Utc::now().timestamp();
        let plain = ClosedForm.risk(&fraud_features(A, B, 0.002), now);
        let micro = ClosedForm.risk(&fraud_features(A, B, 0.0005), now);

        assert!(!plain.risk_factors.contains(&"micro_transaction".to_string()));
        assert!(micro.risk_factors.contains(&"micro_transaction".to_string()));
        assert!((micro.risk_score - plain.risk_score - 0.15).abs() < 1e-9);
    }

    #[test]
    fn test_similar_addresses() {
        let near = "0x00000000000000000000000000000000000000000000000000000000000000ab";
        assert!(addresses_similar(A, near));
        assert!(!addresses_similar(A, A));
        assert!(!addresses_similar(A, B));

        let assessment = ClosedForm.risk(&fraud_features(A, near, 999.0), Utc::now().timestamp());
        assert!(assessment.risk_factors.contains(&"similar_addresses".to_string()));
    }

    #[test]
    fn test_timing_risk() {
        // 2024-01-15 12:00:00 UTC
        let now = 1_705_320_000;
        assert_eq!(timing_risk(now + 600, now), 0.3);
        assert_eq!(timing_risk(now - 40 * 86_400, now), 0.2);
        // 03:00 UTC the same day
        assert_eq!(timing_risk(now - 9 * 3600, now), 0.1);
        assert_eq!(timing_risk(now - 3600, now), 0.0);
    }

    #[tokio::test]
    async fn test_engine_without_inference_uses_closed_form() {
        let engine = PredictionEngine::closed_form_only();
        assert_eq!(engine.strategy().name(), "closed_form");

        let prediction = engine
            .predict_fee(&fee_features(500.0, 0.2, Priority::High), vec![])
            .await
            .unwrap();
        assert!(prediction.predicted_fee > 0.0);
        assert_eq!(prediction.confidence, CLOSED_FORM_FEE_CONFIDENCE);
        assert_eq!(prediction.model, "closed_form");
    }

    #[tokio::test]
    async fn test_engine_fraud_analysis_fields() {
        let engine = PredictionEngine::closed_form_only();
        let prediction = engine.predict_fraud(&fraud_features(A, B, 10.0), vec![]).await.unwrap();

        assert!((0.0..=1.0).contains(&prediction.risk_score));
        assert_eq!(prediction.analysis["pattern"], "no_history");
        assert_eq!(prediction.analysis["amount"], 10.0);
    }
}
