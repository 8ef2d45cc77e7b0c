//! Metrics collection for the prediction oracle.
//!
//! In-process counters and per-endpoint latency samples, exposed through
//! `health()` as a serializable snapshot.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

pub const REQUESTS_TOTAL: &str = "requests_total";
pub const RATE_LIMITED_TOTAL: &str = "rate_limited_total";
pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
pub const STALE_SERVED_TOTAL: &str = "stale_served_total";
pub const FALLBACK_SERVED_TOTAL: &str = "fallback_served_total";
pub const INFERENCE_REFINED_TOTAL: &str = "inference_refined_total";
pub const ERRORS_TOTAL: &str = "errors_total";

/// Latency samples kept per endpoint.
const MAX_LATENCY_SAMPLES: usize = 1000;

/// Oracle metrics collector.
#[derive(Clone, Default)]
pub struct OracleMetricsCollector {
    metrics: Arc<RwLock<InternalMetrics>>,
}

#[derive(Debug, Default)]
struct InternalMetrics {
    counters: HashMap<String, u64>,
    /// Latency samples in milliseconds, per endpoint
    latencies: HashMap<String, VecDeque<f64>>,
}

impl OracleMetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn increment_counter(&self, name: &str) {
        let mut metrics = self.metrics.write().await;
        *metrics.counters.entry(name.to_string()).or_insert(0) += 1;
    }

    /// Record how long one request to `endpoint` took.
    pub async fn record_latency(&self, endpoint: &str, duration: Duration) {
        let millis = duration.as_secs_f64() * 1000.0;
        let mut metrics = self.metrics.write().await;
        let samples = metrics.latencies.entry(endpoint.to_string()).or_default();
        if samples.len() >= MAX_LATENCY_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(millis);
        debug!("Recorded {:.1}ms latency for {}", millis, endpoint);
    }

    pub async fn counter(&self, name: &str) -> u64 {
        self.metrics.read().await.counters.get(name).copied().unwrap_or(0)
    }

    /// Get current metric values.
    pub async fn get_metrics_snapshot(&self) -> MetricsSnapshot {
        let metrics = self.metrics.read().await;
        let average_latency_ms = metrics
            .latencies
            .iter()
            .filter(|(_, samples)| !samples.is_empty())
            .map(|(endpoint, samples)| {
                let avg = samples.iter().sum::<f64>() / samples.len() as f64;
                (endpoint.clone(), avg)
            })
            .collect();

        MetricsSnapshot {
            counters: metrics.counters.clone(),
            average_latency_ms,
            timestamp: Utc::now(),
        }
    }
}

/// Snapshot of current metrics.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub average_latency_ms: HashMap<String, f64>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_collector_creation() {
        let collector = OracleMetricsCollector::new();
        let snapshot = collector.get_metrics_snapshot().await;
        assert!(snapshot.counters.is_empty());
        assert!(snapshot.average_latency_ms.is_empty());
    }

    #[tokio::test]
    async fn test_increment_counter() {
        let collector = OracleMetricsCollector::new();
        collector.increment_counter(REQUESTS_TOTAL).await;
        collector.increment_counter(REQUESTS_TOTAL).await;

        assert_eq!(collector.counter(REQUESTS_TOTAL).await, 2);
        assert_eq!(collector.counter(ERRORS_TOTAL).await, 0);
    }

    #[tokio::test]
    async fn test_average_latency() {
        let collector = OracleMetricsCollector::new();
        collector.record_latency("predict_fee", Duration::from_millis(100)).await;
        collector.record_latency("predict_fee", Duration::from_millis(300)).await;

        let snapshot = collector.get_metrics_snapshot().await;
        let avg = snapshot.average_latency_ms["predict_fee"];
        assert!((avg - 200.0).abs() < 0.001);
    }

    #[tokio::test]
    async fn test_latency_window_keeps_newest_samples() {
        let collector = OracleMetricsCollector::new();
        for _ in 0..MAX_LATENCY_SAMPLES {
            collector.record_latency("predict_fraud", Duration::from_millis(10)).await;
        }
        for _ in 0..MAX_LATENCY_SAMPLES {
            collector.record_latency("predict_fraud", Duration::from_millis(30)).await;
        }

        let snapshot = collector.get_metrics_snapshot().await;
        assert!((snapshot.average_latency_ms["predict_fraud"] - 30.0).abs() < 0.001);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let collector = OracleMetricsCollector::new();
        let other = collector.clone();
        other.increment_counter(CACHE_HITS_TOTAL).await;

        assert_eq!(collector.counter(CACHE_HITS_TOTAL).await, 1);
    }
}
