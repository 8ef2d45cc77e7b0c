mod common;

use aptash_oracle::oracle::circuit_breaker::BreakerState;
use aptash_oracle::types::{FraudRequest, SignedTransfer};
use aptash_oracle::PredictiveOracle;
use common::{test_builder, Harness, Mode, ALICE, BOB};
use serde_json::json;
use std::sync::atomic::Ordering;

fn fraud_request(sender: &str, recipient: &str, amount: f64) -> FraudRequest {
    FraudRequest {
        sender: sender.to_string(),
        recipient: recipient.to_string(),
        amount,
        timestamp: None,
    }
}

async fn risk_score(oracle: &PredictiveOracle, sender: &str, recipient: &str, amount: f64) -> f64 {
    oracle
        .predict_fraud("10.0.0.1", fraud_request(sender, recipient, amount))
        .await
        .data
        .unwrap()
        .prediction
        .risk_score
}

fn transfer() -> SignedTransfer {
    SignedTransfer {
        sender: ALICE.to_string(),
        recipient: BOB.to_string(),
        amount: 100_000_000,
        payload: json!({
            "sender": ALICE,
            "sequence_number": "10",
            "signature": { "type": "ed25519_signature" }
        }),
    }
}

#[tokio::test]
async fn test_fraud_flags_match_risk_score() {
    let harness = Harness::healthy();
    let oracle = test_builder().build_with_sources(harness.sources());

    for (sender, recipient, amount) in [(ALICE, BOB, 999.0), (ALICE, ALICE, 1000.0), (ALICE, BOB, 1000.0)] {
        let response = oracle.predict_fraud("10.0.0.1", fraud_request(sender, recipient, amount)).await;
        let json = serde_json::to_value(&response).unwrap();
        let report = response.data.unwrap();

        let score = report.prediction.risk_score;
        assert!((0.0..=1.0).contains(&score));
        assert_eq!(report.is_suspicious, score > 0.6);
        assert_eq!(report.is_high_risk, score > 0.8);
        assert_eq!(json["is_suspicious"], report.is_suspicious);
        assert_eq!(json["model"], "rule_based_analysis");
    }
}

#[tokio::test]
async fn test_self_transfer_and_round_amount_add_up() {
    let harness = Harness::healthy();
    let oracle = test_builder().build_with_sources(harness.sources());

    let plain = risk_score(&oracle, ALICE, BOB, 999.0).await;
    let self_only = risk_score(&oracle, ALICE, ALICE, 999.0).await;
    let round_only = risk_score(&oracle, ALICE, BOB, 1000.0).await;
    let both = risk_score(&oracle, ALICE, ALICE, 1000.0).await;

    assert!((plain - 0.3).abs() < 1e-9);
    assert!((self_only - plain - 0.3).abs() < 1e-9);
    assert!((round_only - plain - 0.1).abs() < 1e-9);
    assert!((both - plain - 0.4).abs() < 1e-9);
}

#[tokio::test]
async fn test_unusually_large_transfer_against_history() {
    let harness = Harness::healthy();
    harness
        .chain
        .histories
        .lock()
        .unwrap()
        .insert(ALICE.to_string(), vec![1.0, 2.0, 3.0, 2.0, 1.0, 2.0]);
    let oracle = test_builder().build_with_sources(harness.sources());

    let response = oracle.predict_fraud("10.0.0.1", fraud_request(ALICE, BOB, 500.0)).await;
    let report = response.data.unwrap();

    assert!(report
        .prediction
        .risk_factors
        .contains(&"pattern_unusually_large".to_string()));
    assert_eq!(report.prediction.analysis["pattern"], "unusually_large");
    assert!((report.prediction.risk_score - 0.6).abs() < 1e-9);
}

#[tokio::test]
async fn test_fraud_rejects_bad_address() {
    let harness = Harness::healthy();
    let oracle = test_builder().build_with_sources(harness.sources());

    let response = oracle.predict_fraud("10.0.0.1", fraud_request("0xnothex", BOB, 5.0)).await;
    let json = serde_json::to_value(&response).unwrap();

    assert_eq!(json["status"], "error");
    assert_eq!(json["error"]["code"], "VALIDATION_ERROR");
    assert_eq!(harness.prices.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_submit_transfer_returns_hash() {
    let harness = Harness::healthy();
    let oracle = test_builder().build_with_sources(harness.sources());

    let response = oracle.submit_transfer("10.0.0.1", transfer()).await;

    assert!(response.is_success());
    let receipt = response.data.unwrap();
    assert_eq!(receipt.hash, "0xfeed");
    assert_eq!(receipt.sender, ALICE);
    assert_eq!(harness.chain.submit_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_submit_failures_open_circuit() {
    let harness = Harness::healthy();
    *harness.chain.submit.lock().unwrap() = Mode::Down;
    let oracle = test_builder()
        .with_circuit_breaker(2, 60_000)
        .build_with_sources(harness.sources());

    for _ in 0..2 {
        let failed = oracle.submit_transfer("10.0.0.1", transfer()).await;
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["error"]["code"], "UPSTREAM_UNAVAILABLE");
    }

    let rejected = oracle.submit_transfer("10.0.0.1", transfer()).await;
    let json = serde_json::to_value(&rejected).unwrap();
    assert_eq!(json["status"], "error");
    assert_eq!(json["error"]["code"], "SERVICE_CIRCUIT_OPEN");

    // never retried, and the open breaker short-circuits the third call
    assert_eq!(harness.chain.submit_calls.load(Ordering::SeqCst), 2);

    let health = oracle.health().await;
    assert_eq!(health.status, "degraded");
    let transfer_health = health
        .services
        .iter()
        .find(|s| s.service == "transfer_submission")
        .unwrap();
    assert_eq!(transfer_health.state, BreakerState::Open);
}

#[tokio::test]
async fn test_healthy_report() {
    let harness = Harness::healthy();
    let oracle = test_builder().build_with_sources(harness.sources());

    oracle.predict_fraud("10.0.0.1", fraud_request(ALICE, BOB, 5.0)).await;
    let health = oracle.health().await;

    assert_eq!(health.status, "healthy");
    assert!(!health.inference_enabled);
    assert!(health.metrics.counters["requests_total"] >= 1);
}
