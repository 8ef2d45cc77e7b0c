//! Rate limiting for inbound callers and outbound upstream calls.
//!
//! Inbound requests are gated by a fixed-window counter per client key.
//! Outbound calls to each upstream are paced by a governor limiter so the
//! oracle never fires faster than that upstream's own limits allow.

use crate::oracle::storage::{MokaStore, StateStore};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as GovernorLimiter};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Counter state for one client inside one window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateWindow {
    pub count: u32,
    pub window_start: Instant,
}

/// Client windows tracked at once before the least used are evicted.
pub const MAX_TRACKED_CLIENTS: u64 = 100_000;

/// Fixed-window limiter keyed by client identifier.
pub struct RateLimiter {
    store: Arc<dyn StateStore<RateWindow>>,
    window: Duration,
    max_requests: u32,
}

impl RateLimiter {
    /// Create a limiter with its own bounded window store.
    ///
    /// A client idle for a whole window has nothing left to count, so its
    /// entry expires after `window` without use.
    pub fn new(window: Duration, max_requests: u32) -> Self {
        let store = MokaStore::with_time_to_idle(MAX_TRACKED_CLIENTS, window);
        Self::with_store(Arc::new(store), window, max_requests)
    }

    /// Create a limiter over an injected store.
    pub fn with_store(
        store: Arc<dyn StateStore<RateWindow>>,
        window: Duration,
        max_requests: u32,
    ) -> Self {
        Self {
            store,
            window,
            max_requests,
        }
    }

    /// Count one request for `client` and report whether it may proceed.
    #[instrument(skip(self), fields(client = %client))]
    pub async fn check_and_consume(&self, client: &str) -> bool {
        let now = Instant::now();
        let window = self.window;
        let max_requests = self.max_requests;
        let mut allowed = false;

        self.store
            .modify(client, &mut |slot: &mut Option<RateWindow>| {
                match slot {
                    Some(state) if now.duration_since(state.window_start) <= window => {
                        state.count = state.count.saturating_add(1);
                        allowed = state.count <= max_requests;
                    }
                    _ => {
                        *slot = Some(RateWindow {
                            count: 1,
                            window_start: now,
                        });
                        allowed = max_requests > 0;
                    }
                }
            })
            .await;

        if allowed {
            debug!("Rate limit check passed for {}", client);
        } else {
            warn!("Rate limit exceeded for {}", client);
        }
        allowed
    }

    /// Current window state for a client, if any.
    pub async fn window_for(&self, client: &str) -> Option<RateWindow> {
        self.store.get(client).await
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Minimum spacing between calls to one upstream.
pub struct UpstreamCadence {
    name: String,
    limiter: Option<DefaultDirectRateLimiter>,
    min_interval: Duration,
}

impl UpstreamCadence {
    /// Create a cadence allowing one call per `min_interval`.
    ///
    /// A zero interval disables pacing entirely.
    pub fn new(name: &str, min_interval: Duration) -> Self {
        let limiter = Quota::with_period(min_interval).map(|quota| GovernorLimiter::direct(quota));
        if limiter.is_none() {
            debug!("Cadence for {} disabled (zero interval)", name);
        }

        Self {
            name: name.to_string(),
            limiter,
            min_interval,
        }
    }

    /// Sleep until the next call slot for this upstream is available.
    #[instrument(skip(self), fields(upstream = %self.name))]
    pub async fn wait(&self) {
        if let Some(limiter) = &self.limiter {
            if limiter.check().is_err() {
                debug!("Pacing call to {} (min interval {:?})", self.name, self.min_interval);
                limiter.until_ready().await;
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::storage::InMemoryStore;

    #[tokio::test(start_paused = true)]
    async fn test_window_boundary() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 3);

        let mut results = Vec::new();
        for _ in 0..4 {
            results.push(limiter.check_and_consume("10.0.0.1").await);
        }
        assert_eq!(results, vec![true, true, true, false]);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.check_and_consume("10.0.0.1").await);
        assert_eq!(limiter.window_for("10.0.0.1").await.map(|w| w.count), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clients_are_independent() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 1);

        assert!(limiter.check_and_consume("a").await);
        assert!(!limiter.check_and_consume("a").await);
        assert!(limiter.check_and_consume("b").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_requests_still_count() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 2);

        for _ in 0..5 {
            limiter.check_and_consume("c").await;
        }
        assert_eq!(limiter.window_for("c").await.map(|w| w.count), Some(5));
    }

    #[tokio::test]
    async fn test_idle_client_windows_expire() {
        let limiter = RateLimiter::new(Duration::from_millis(50), 5);
        for client in ["a", "b", "c"] {
            assert!(limiter.check_and_consume(client).await);
        }
        assert!(limiter.window_for("a").await.is_some());

        tokio::time::sleep(Duration::from_millis(150)).await;
        for client in ["a", "b", "c"] {
            assert!(limiter.window_for(client).await.is_none());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_store_between_limiters() {
        let store: Arc<dyn StateStore<RateWindow>> = Arc::new(InMemoryStore::new());
        let first = RateLimiter::with_store(store.clone(), Duration::from_secs(60), 2);
        let second = RateLimiter::with_store(store, Duration::from_secs(60), 2);

        assert!(first.check_and_consume("ip").await);
        assert!(second.check_and_consume("ip").await);
        assert!(!first.check_and_consume("ip").await);
    }

    #[tokio::test]
    async fn test_zero_interval_cadence_never_waits() {
        let cadence = UpstreamCadence::new("price_oracle", Duration::ZERO);
        let started = std::time::Instant::now();
        for _ in 0..10 {
            cadence.wait().await;
        }
        assert!(started.elapsed() < Duration::from_millis(50));
        assert_eq!(cadence.name(), "price_oracle");
    }

    #[tokio::test]
    async fn test_cadence_spaces_calls() {
        let cadence = UpstreamCadence::new("chain_node", Duration::from_millis(40));
        let started = std::time::Instant::now();
        cadence.wait().await;
        cadence.wait().await;
        cadence.wait().await;
        assert!(started.elapsed() >= Duration::from_millis(70));
    }
}
