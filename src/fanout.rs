// =============================================================================
// Fan-out Hub — per-tier broadcast of flushed metric snapshots
// =============================================================================
//
// One broadcast channel per subscription tier. Every successful persistence
// flush publishes the flushed snapshots once; each tier's channel carries the
// frame already projected and serialized for that tier, so per-subscriber
// work is a clone of an Arc'd string. Slow subscribers lag and drop frames
// (broadcast ring semantics) without ever stalling the pipeline.
//
// The hub also keeps the latest snapshot per symbol, which is what the
// snapshot (paging) request in the WS gateway reads — subscribers never
// touch the window store or the database.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use crate::metrics::MetricSnapshot;
use crate::types::Tier;

/// Broadcast ring capacity per tier. A subscriber that falls more than this
/// many frames behind observes `Lagged` and resumes from the newest frame.
const CHANNEL_CAPACITY: usize = 64;

pub struct FanoutHub {
    /// One sender per tier, indexed by `Tier::index()`.
    senders: [broadcast::Sender<Arc<str>>; 3],
    /// Latest flushed snapshot per symbol.
    latest: RwLock<HashMap<String, Arc<MetricSnapshot>>>,
}

impl Default for FanoutHub {
    fn default() -> Self {
        Self::new()
    }
}

impl FanoutHub {
    pub fn new() -> Self {
        Self {
            senders: [
                broadcast::channel(CHANNEL_CAPACITY).0,
                broadcast::channel(CHANNEL_CAPACITY).0,
                broadcast::channel(CHANNEL_CAPACITY).0,
            ],
            latest: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to the delta feed for one tier.
    pub fn subscribe(&self, tier: Tier) -> broadcast::Receiver<Arc<str>> {
        self.senders[tier.index()].subscribe()
    }

    /// Publish one flushed batch: refresh the latest-snapshot cache, then
    /// emit one pre-serialized delta frame per tier.
    pub fn publish(&self, flushed: &[Arc<MetricSnapshot>]) {
        if flushed.is_empty() {
            return;
        }

        {
            let mut latest = self.latest.write();
            for snap in flushed {
                latest.insert(snap.symbol.clone(), Arc::clone(snap));
            }
        }

        for tier in Tier::ALL {
            let data: Vec<serde_json::Value> =
                flushed.iter().map(|snap| snap.project(tier)).collect();

            let frame = serde_json::json!({
                "type": "delta",
                "data": data,
            });

            // Err means no live subscribers on this tier; nothing to do.
            let receivers = self.senders[tier.index()]
                .send(Arc::from(frame.to_string()))
                .unwrap_or(0);

            debug!(
                tier = %tier,
                symbols = flushed.len(),
                receivers,
                "delta frame published"
            );
        }
    }

    /// Latest snapshots whose symbol ends with `quote`, unsorted. The WS
    /// gateway sorts and pages these per request.
    pub fn snapshots_for_quote(&self, quote: &str) -> Vec<Arc<MetricSnapshot>> {
        self.latest
            .read()
            .values()
            .filter(|snap| snap.symbol.ends_with(quote))
            .cloned()
            .collect()
    }

    /// Number of symbols currently cached.
    pub fn cached_count(&self) -> usize {
        self.latest.read().len()
    }

    /// Live subscribers on one tier's channel.
    pub fn subscriber_count(&self, tier: Tier) -> usize {
        self.senders[tier.index()].receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::FrameMetrics;
    use crate::types::Timeframe;

    fn sample_snapshot(symbol: &str, price: f64) -> Arc<MetricSnapshot> {
        Arc::new(MetricSnapshot {
            symbol: symbol.to_string(),
            as_of: 1_700_000_000_000,
            last_price: price,
            price_change_pct_24h: 1.5,
            high_24h: price + 5.0,
            low_24h: price - 5.0,
            quote_volume_24h: 1_000.0,
            bid: price - 0.1,
            ask: price + 0.1,
            spread: Some(0.2),
            frames: vec![FrameMetrics::empty(Timeframe::M1)],
        })
    }

    #[tokio::test]
    async fn publish_updates_cache_and_broadcasts() {
        let hub = FanoutHub::new();
        let mut rx = hub.subscribe(Tier::Pro);

        hub.publish(&[sample_snapshot("BTCUSDT", 100.0)]);
        assert_eq!(hub.cached_count(), 1);

        let frame = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["type"], "delta");
        assert_eq!(parsed["data"][0]["symbol"], "BTCUSDT");
        // Pro frames carry the buy/sell volume split.
        assert!(parsed["data"][0].get("m1_bv").is_some());
    }

    #[tokio::test]
    async fn free_tier_frame_omits_frame_metrics() {
        let hub = FanoutHub::new();
        let mut rx = hub.subscribe(Tier::Free);

        hub.publish(&[sample_snapshot("ETHUSDT", 2_000.0)]);

        let frame = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["data"][0]["symbol"], "ETHUSDT");
        assert!(parsed["data"][0].get("m1_rsi").is_none());
        assert!(parsed["data"][0].get("m1_bv").is_none());
    }

    #[test]
    fn latest_snapshot_wins_in_cache() {
        let hub = FanoutHub::new();
        hub.publish(&[sample_snapshot("BTCUSDT", 100.0)]);
        hub.publish(&[sample_snapshot("BTCUSDT", 105.0)]);

        let cached = hub.snapshots_for_quote("USDT");
        assert_eq!(cached.len(), 1);
        assert!((cached[0].last_price - 105.0).abs() < f64::EPSILON);
    }

    #[test]
    fn quote_filter_matches_suffix() {
        let hub = FanoutHub::new();
        hub.publish(&[
            sample_snapshot("BTCUSDT", 1.0),
            sample_snapshot("ETHBTC", 2.0),
            sample_snapshot("SOLUSDC", 3.0),
        ]);

        let usdt = hub.snapshots_for_quote("USDT");
        assert_eq!(usdt.len(), 1);
        assert_eq!(usdt[0].symbol, "BTCUSDT");
    }

    #[test]
    fn subscriber_count_tracks_receiver_drops() {
        let hub = FanoutHub::new();
        assert_eq!(hub.subscriber_count(Tier::Plus), 0);

        let rx = hub.subscribe(Tier::Plus);
        let rx2 = hub.subscribe(Tier::Plus);
        assert_eq!(hub.subscriber_count(Tier::Plus), 2);
        assert_eq!(hub.subscriber_count(Tier::Pro), 0);

        drop(rx);
        assert_eq!(hub.subscriber_count(Tier::Plus), 1);
        drop(rx2);
        assert_eq!(hub.subscriber_count(Tier::Plus), 0);
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let hub = FanoutHub::new();
        hub.publish(&[sample_snapshot("BTCUSDT", 1.0)]);
        assert_eq!(hub.cached_count(), 1);
    }
}
