// =============================================================================
// MetricsEngine — multi-timeframe metrics over one symbol's window snapshot
// =============================================================================
//
// Every metric helper is a total function over the window slice: a short or
// degenerate window degrades that symbol's snapshot to omitted fields and
// neutral RSI, and can never abort the batch or poison another symbol.
//
// return_pct distinguishes "unknown" (no candle at the horizon — omitted)
// from "flat" (0.0). Extrapolating a short-timeframe return from the 24h
// change is deliberately not done: omitted means omitted.
// =============================================================================

pub mod rsi;

use serde::Serialize;

use crate::types::{Tier, Timeframe};
use crate::window::{Candle, Ticker};

/// Metrics for a single timeframe, tagged by the timeframe itself.
#[derive(Debug, Clone, Serialize)]
pub struct FrameMetrics {
    pub timeframe: Timeframe,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buy_volume: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sell_volume: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net_volume: Option<f64>,
    pub rsi: f64,
}

impl FrameMetrics {
    pub fn empty(timeframe: Timeframe) -> Self {
        Self {
            timeframe,
            return_pct: None,
            high: None,
            low: None,
            range_pct: None,
            volume: None,
            buy_volume: None,
            sell_volume: None,
            net_volume: None,
            rsi: rsi::NEUTRAL_RSI,
        }
    }
}

/// Immutable computed state for one symbol at one instant. Later snapshots
/// supersede earlier ones for the same symbol; nothing mutates one in place.
#[derive(Debug, Clone, Serialize)]
pub struct MetricSnapshot {
    pub symbol: String,
    /// Epoch milliseconds of the newest candle (or wall clock when the
    /// window is still empty).
    pub as_of: i64,
    pub last_price: f64,
    pub price_change_pct_24h: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub quote_volume_24h: f64,
    pub bid: f64,
    pub ask: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spread: Option<f64>,
    /// One entry per [`Timeframe::ALL`], in order.
    pub frames: Vec<FrameMetrics>,
}

/// Computes [`MetricSnapshot`]s from window snapshots and latest tickers.
pub struct MetricsEngine {
    rsi_period: usize,
}

impl MetricsEngine {
    pub fn new(rsi_period: usize) -> Self {
        Self { rsi_period }
    }

    /// Build the snapshot for one symbol. `candles` is an owned window copy
    /// (oldest first); `ticker` is the latest 24h ticker if one has been
    /// observed.
    pub fn compute(
        &self,
        symbol: &str,
        candles: &[Candle],
        ticker: Option<&Ticker>,
    ) -> MetricSnapshot {
        let as_of = candles
            .last()
            .map(|c| c.close_time)
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

        let frames = Timeframe::ALL
            .iter()
            .map(|&tf| self.compute_frame(tf, candles, as_of))
            .collect();

        let (last_price, change, high, low, qv, bid, ask, spread) = match ticker {
            Some(t) => (
                t.last_price,
                t.price_change_pct_24h,
                t.high_24h,
                t.low_24h,
                t.quote_volume_24h,
                t.bid,
                t.ask,
                t.spread(),
            ),
            // Ticker not yet observed — fall back to the newest close so the
            // row is still meaningful.
            None => (
                candles.last().map(|c| c.close).unwrap_or(0.0),
                0.0,
                0.0,
                0.0,
                0.0,
                0.0,
                0.0,
                None,
            ),
        };

        MetricSnapshot {
            symbol: symbol.to_string(),
            as_of,
            last_price,
            price_change_pct_24h: change,
            high_24h: high,
            low_24h: low,
            quote_volume_24h: qv,
            bid,
            ask,
            spread,
            frames,
        }
    }

    fn compute_frame(&self, tf: Timeframe, candles: &[Candle], as_of: i64) -> FrameMetrics {
        if candles.is_empty() {
            return FrameMetrics::empty(tf);
        }

        let horizon = as_of - tf.millis();

        // Candles inside the timeframe window.
        let start = candles.partition_point(|c| c.close_time <= horizon);
        let slice = &candles[start..];

        // Closest candle at or before the horizon anchors the return.
        let current_close = candles[candles.len() - 1].close;
        let return_pct = candles[..start].last().and_then(|base| {
            if base.close > 0.0 {
                Some((current_close - base.close) / base.close * 100.0)
            } else {
                None
            }
        });

        let mut metrics = FrameMetrics::empty(tf);
        metrics.return_pct = return_pct;
        metrics.rsi = rsi::latest_rsi(&sampled_closes(candles, tf), self.rsi_period);

        if slice.is_empty() {
            return metrics;
        }

        let high = slice.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let low = slice.iter().map(|c| c.low).fold(f64::MAX, f64::min);
        metrics.high = Some(high);
        metrics.low = Some(low);
        metrics.range_pct = if low > 0.0 {
            Some((high - low) / low * 100.0)
        } else {
            None
        };

        let volume: f64 = slice.iter().map(|c| c.quote_volume).sum();
        let buy_volume: f64 = slice.iter().map(|c| c.taker_buy_quote_volume).sum();
        let sell_volume = volume - buy_volume;
        metrics.volume = Some(volume);
        metrics.buy_volume = Some(buy_volume);
        metrics.sell_volume = Some(sell_volume);
        metrics.net_volume = Some(buy_volume - sell_volume);

        metrics
    }
}

/// Closes sampled at the timeframe's spacing (every `tf` candles, ending at
/// the newest), oldest first. Only 1m candles are ingested, so this is how
/// an N-minute RSI gets its series — largest sample available.
fn sampled_closes(candles: &[Candle], tf: Timeframe) -> Vec<f64> {
    let stride = tf.minutes() as usize;
    let mut closes: Vec<f64> = candles
        .iter()
        .rev()
        .step_by(stride.max(1))
        .map(|c| c.close)
        .collect();
    closes.reverse();
    closes
}

// =============================================================================
// Tier projections
// =============================================================================

impl MetricSnapshot {
    /// Flatten the snapshot into the field set a given tier may see.
    ///
    /// Free: identity and 24h ticker only. Plus: adds book prices and
    /// per-timeframe return / range / volume / RSI. Pro: adds the
    /// buy / sell / net volume split.
    pub fn project(&self, tier: Tier) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        obj.insert("symbol".into(), serde_json::json!(self.symbol));
        obj.insert("last_price".into(), serde_json::json!(self.last_price));
        obj.insert(
            "price_change_pct_24h".into(),
            serde_json::json!(self.price_change_pct_24h),
        );
        obj.insert("high_24h".into(), serde_json::json!(self.high_24h));
        obj.insert("low_24h".into(), serde_json::json!(self.low_24h));
        obj.insert(
            "quote_volume_24h".into(),
            serde_json::json!(self.quote_volume_24h),
        );

        if tier == Tier::Free {
            return serde_json::Value::Object(obj);
        }

        obj.insert("as_of".into(), serde_json::json!(self.as_of));
        obj.insert("bid".into(), serde_json::json!(self.bid));
        obj.insert("ask".into(), serde_json::json!(self.ask));
        obj.insert("spread".into(), serde_json::json!(self.spread));

        for frame in &self.frames {
            let label = frame.timeframe.label();
            obj.insert(format!("{label}_r_pct"), serde_json::json!(frame.return_pct));
            obj.insert(format!("{label}_high"), serde_json::json!(frame.high));
            obj.insert(format!("{label}_low"), serde_json::json!(frame.low));
            obj.insert(
                format!("{label}_range_pct"),
                serde_json::json!(frame.range_pct),
            );
            obj.insert(format!("{label}_vol"), serde_json::json!(frame.volume));
            obj.insert(format!("{label}_rsi"), serde_json::json!(frame.rsi));

            if tier == Tier::Pro {
                obj.insert(format!("{label}_bv"), serde_json::json!(frame.buy_volume));
                obj.insert(format!("{label}_sv"), serde_json::json!(frame.sell_volume));
                obj.insert(format!("{label}_nv"), serde_json::json!(frame.net_volume));
            }
        }

        serde_json::Value::Object(obj)
    }

    /// The metrics for one timeframe, if the snapshot carries it.
    pub fn frame(&self, tf: Timeframe) -> Option<&FrameMetrics> {
        self.frames.iter().find(|f| f.timeframe == tf)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open_time: i64, close: f64) -> Candle {
        Candle {
            open_time,
            close_time: open_time + 59_999,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            base_volume: 10.0,
            quote_volume: 100.0,
            taker_buy_quote_volume: 60.0,
            is_closed: true,
        }
    }

    fn minute_candles(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| candle(i as i64 * 60_000, c))
            .collect()
    }

    fn ticker(symbol: &str, price: f64) -> Ticker {
        Ticker {
            symbol: symbol.into(),
            last_price: price,
            bid: price - 0.5,
            ask: price + 0.5,
            price_change_pct_24h: 2.5,
            high_24h: price + 10.0,
            low_24h: price - 10.0,
            quote_volume_24h: 1_000_000.0,
        }
    }

    #[test]
    fn return_pct_over_two_minutes() {
        // Window [11, 9, 12]: return over the last 2 minutes anchors on the
        // candle closing 2 minutes before the newest — close 11.
        let candles = minute_candles(&[11.0, 9.0, 12.0]);
        let engine = MetricsEngine::new(14);
        let snap = engine.compute("BTCUSDT", &candles, Some(&ticker("BTCUSDT", 12.0)));

        let m2 = snap.frame(Timeframe::M2).unwrap().return_pct.unwrap();
        assert!((m2 - (12.0 - 11.0) / 11.0 * 100.0).abs() < 1e-9, "{m2}");

        // 1-minute return anchors on the middle candle (close 9).
        let m1 = snap.frame(Timeframe::M1).unwrap().return_pct.unwrap();
        assert!((m1 - (12.0 - 9.0) / 9.0 * 100.0).abs() < 1e-9, "{m1}");
    }

    #[test]
    fn return_pct_omitted_without_horizon_candle() {
        // Two candles: nothing closed at or before now-5m, so m5 return is
        // unknown — omitted, not zero.
        let candles = minute_candles(&[10.0, 10.0]);
        let engine = MetricsEngine::new(14);
        let snap = engine.compute("BTCUSDT", &candles, None);
        assert!(snap.frame(Timeframe::M5).unwrap().return_pct.is_none());
        assert!(snap.frame(Timeframe::M60).unwrap().return_pct.is_none());
    }

    #[test]
    fn volume_split_is_consistent() {
        let candles = minute_candles(&[10.0, 11.0, 12.0, 13.0, 14.0]);
        let engine = MetricsEngine::new(14);
        let snap = engine.compute("BTCUSDT", &candles, None);

        for frame in &snap.frames {
            if let (Some(vol), Some(bv), Some(sv)) =
                (frame.volume, frame.buy_volume, frame.sell_volume)
            {
                assert!((bv + sv - vol).abs() < 1e-9, "{}", frame.timeframe);
                assert!(
                    (frame.net_volume.unwrap() - (bv - sv)).abs() < 1e-9,
                    "{}",
                    frame.timeframe
                );
            }
        }

        // m5 covers all five candles.
        let m5 = snap.frame(Timeframe::M5).unwrap();
        assert!((m5.volume.unwrap() - 500.0).abs() < 1e-9);
        assert!((m5.buy_volume.unwrap() - 300.0).abs() < 1e-9);
    }

    #[test]
    fn range_pct_over_slice() {
        let candles = minute_candles(&[10.0, 12.0, 11.0]);
        let engine = MetricsEngine::new(14);
        let snap = engine.compute("BTCUSDT", &candles, None);

        // m3 slice = all candles: high = 13, low = 9.
        let m3 = snap.frame(Timeframe::M3).unwrap();
        assert!((m3.high.unwrap() - 13.0).abs() < 1e-9);
        assert!((m3.low.unwrap() - 9.0).abs() < 1e-9);
        assert!((m3.range_pct.unwrap() - (13.0 - 9.0) / 9.0 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn degenerate_low_omits_range_only() {
        // A zero low must not divide; other fields still computed.
        let mut candles = minute_candles(&[1.0, 1.0]);
        candles[0].low = 0.0;
        let engine = MetricsEngine::new(14);
        let snap = engine.compute("XUSDT", &candles, None);
        let m2 = snap.frame(Timeframe::M2).unwrap();
        assert!(m2.range_pct.is_none());
        assert!(m2.volume.is_some());
    }

    #[test]
    fn empty_window_yields_neutral_snapshot() {
        let engine = MetricsEngine::new(14);
        let snap = engine.compute("NEWUSDT", &[], Some(&ticker("NEWUSDT", 3.0)));
        assert!((snap.last_price - 3.0).abs() < f64::EPSILON);
        for frame in &snap.frames {
            assert!(frame.return_pct.is_none());
            assert!(frame.volume.is_none());
            assert!((frame.rsi - 50.0).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn rsi_flat_window_is_neutral_every_timeframe() {
        let candles = minute_candles(&vec![100.0; 20]);
        let engine = MetricsEngine::new(14);
        let snap = engine.compute("BTCUSDT", &candles, None);
        for frame in &snap.frames {
            assert!((frame.rsi - 50.0).abs() < f64::EPSILON, "{}", frame.timeframe);
        }
    }

    #[test]
    fn sampled_closes_stride() {
        let candles = minute_candles(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        assert_eq!(sampled_closes(&candles, Timeframe::M1), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        assert_eq!(sampled_closes(&candles, Timeframe::M3), vec![1.0, 4.0, 7.0]);
        assert_eq!(sampled_closes(&candles, Timeframe::M5), vec![2.0, 7.0]);
    }

    #[test]
    fn frame_lookup_on_partial_frame_set() {
        // A snapshot carrying only a subset of timeframes answers by match,
        // not by position — a missing timeframe is None, never a panic.
        let snap = MetricSnapshot {
            symbol: "BTCUSDT".into(),
            as_of: 0,
            last_price: 1.0,
            price_change_pct_24h: 0.0,
            high_24h: 1.0,
            low_24h: 1.0,
            quote_volume_24h: 0.0,
            bid: 1.0,
            ask: 1.0,
            spread: None,
            frames: vec![FrameMetrics::empty(Timeframe::M5)],
        };
        assert_eq!(snap.frame(Timeframe::M5).unwrap().timeframe, Timeframe::M5);
        assert!(snap.frame(Timeframe::M1).is_none());
        assert!(snap.frame(Timeframe::M60).is_none());
    }

    #[test]
    fn free_projection_hides_timeframe_fields() {
        let candles = minute_candles(&[10.0, 11.0]);
        let engine = MetricsEngine::new(14);
        let snap = engine.compute("BTCUSDT", &candles, Some(&ticker("BTCUSDT", 11.0)));

        let free = snap.project(Tier::Free);
        assert!(free.get("symbol").is_some());
        assert!(free.get("last_price").is_some());
        assert!(free.get("m1_r_pct").is_none());
        assert!(free.get("bid").is_none());

        let plus = snap.project(Tier::Plus);
        assert!(plus.get("m1_r_pct").is_some());
        assert!(plus.get("m1_rsi").is_some());
        assert!(plus.get("m1_bv").is_none());

        let pro = snap.project(Tier::Pro);
        assert!(pro.get("m1_bv").is_some());
        assert!(pro.get("m1_sv").is_some());
        assert!(pro.get("m1_nv").is_some());
    }
}
