// =============================================================================
// WindowStore — bounded rolling candle history plus latest ticker per symbol
// =============================================================================
//
// The only shared-mutable structure crossing tasks: the ingest dispatch is
// the single writer per symbol, the metrics engine reads owned snapshots.
// Access is serialized per symbol entry behind one RwLock'd map; readers
// copy and never hold references into live state.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// A single 1m OHLCV candle. Immutable once closed; the in-progress candle
/// is replaced in place as the exchange streams incremental updates for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub base_volume: f64,
    pub quote_volume: f64,
    pub taker_buy_quote_volume: f64,
    pub is_closed: bool,
}

/// Latest 24h ticker for one symbol, overwritten wholesale on every tick.
/// No history is retained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last_price: f64,
    pub bid: f64,
    pub ask: f64,
    pub price_change_pct_24h: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub quote_volume_24h: f64,
}

impl Ticker {
    /// Ask minus bid, when both sides are quoted.
    pub fn spread(&self) -> Option<f64> {
        if self.bid > 0.0 && self.ask > 0.0 {
            Some(self.ask - self.bid)
        } else {
            None
        }
    }
}

/// Bounded FIFO candle sequence for one symbol.
#[derive(Debug)]
pub struct SymbolWindow {
    candles: VecDeque<Candle>,
    capacity: usize,
}

impl SymbolWindow {
    fn new(capacity: usize) -> Self {
        Self {
            candles: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Apply one candle event.
    ///
    /// * An update to the still-open candle (same `open_time`, last element
    ///   not closed) replaces the last element rather than appending.
    /// * A new candle is appended; the oldest is evicted once `capacity` is
    ///   reached, so `len() <= capacity` holds at all times.
    fn apply(&mut self, candle: Candle) {
        if let Some(last) = self.candles.back() {
            if !last.is_closed && last.open_time == candle.open_time {
                self.candles.pop_back();
            }
        }
        self.candles.push_back(candle);
        while self.candles.len() > self.capacity {
            self.candles.pop_front();
        }
    }

    fn len(&self) -> usize {
        self.candles.len()
    }

    fn snapshot(&self) -> Vec<Candle> {
        self.candles.iter().cloned().collect()
    }
}

#[derive(Debug)]
struct SymbolState {
    ticker: Option<Ticker>,
    window: SymbolWindow,
}

/// Owns one [`SymbolWindow`] + latest [`Ticker`] per instrument.
pub struct WindowStore {
    inner: RwLock<HashMap<String, SymbolState>>,
    capacity: usize,
}

impl WindowStore {
    /// `capacity` is the maximum number of candles retained per symbol.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Register a symbol with an empty window so candles for it are never
    /// silently dropped. No-op if the symbol already exists.
    pub fn ensure_symbol(&self, symbol: &str) {
        let mut map = self.inner.write();
        if !map.contains_key(symbol) {
            map.insert(
                symbol.to_string(),
                SymbolState {
                    ticker: None,
                    window: SymbolWindow::new(self.capacity),
                },
            );
        }
    }

    /// O(1) wholesale replace of the latest ticker.
    pub fn apply_ticker(&self, ticker: Ticker) {
        let mut map = self.inner.write();
        let state = map.entry(ticker.symbol.clone()).or_insert_with(|| SymbolState {
            ticker: None,
            window: SymbolWindow::new(self.capacity),
        });
        state.ticker = Some(ticker);
    }

    /// O(1) append / replace-last with FIFO eviction.
    pub fn apply_candle(&self, symbol: &str, candle: Candle) {
        let mut map = self.inner.write();
        let state = map.entry(symbol.to_string()).or_insert_with(|| SymbolState {
            ticker: None,
            window: SymbolWindow::new(self.capacity),
        });
        state.window.apply(candle);
    }

    /// Seed an empty window from a REST backfill. Ignored when the window
    /// already holds live candles, so a backfill can never clobber stream
    /// state that arrived first.
    pub fn backfill(&self, symbol: &str, candles: Vec<Candle>) {
        let mut map = self.inner.write();
        let state = map.entry(symbol.to_string()).or_insert_with(|| SymbolState {
            ticker: None,
            window: SymbolWindow::new(self.capacity),
        });
        if state.window.len() == 0 {
            for candle in candles {
                state.window.apply(candle);
            }
        }
    }

    /// Owned copy of the candle sequence (oldest first) and latest ticker.
    /// The metrics engine never observes a window mutating mid-read.
    pub fn snapshot(&self, symbol: &str) -> Option<(Vec<Candle>, Option<Ticker>)> {
        let map = self.inner.read();
        map.get(symbol)
            .map(|state| (state.window.snapshot(), state.ticker.clone()))
    }

    pub fn ticker(&self, symbol: &str) -> Option<Ticker> {
        let map = self.inner.read();
        map.get(symbol).and_then(|state| state.ticker.clone())
    }

    /// Symbols with at least one observed ticker, i.e. the active universe
    /// the compute tick iterates.
    pub fn active_symbols(&self) -> Vec<String> {
        let map = self.inner.read();
        map.iter()
            .filter(|(_, state)| state.ticker.is_some())
            .map(|(sym, _)| sym.clone())
            .collect()
    }

    /// Top `n` symbols by 24h quote volume — the kline subscription set.
    pub fn top_by_quote_volume(&self, n: usize) -> Vec<String> {
        let map = self.inner.read();
        let mut ranked: Vec<(String, f64)> = map
            .iter()
            .filter_map(|(sym, state)| {
                state
                    .ticker
                    .as_ref()
                    .map(|t| (sym.clone(), t.quote_volume_24h))
            })
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(n);
        ranked.into_iter().map(|(sym, _)| sym).collect()
    }

    /// Number of candles currently held for `symbol`.
    pub fn window_len(&self, symbol: &str) -> usize {
        let map = self.inner.read();
        map.get(symbol).map_or(0, |state| state.window.len())
    }

    /// Total tracked symbols.
    pub fn symbol_count(&self) -> usize {
        self.inner.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn sample_candle(open_time: i64, close: f64, is_closed: bool) -> Candle {
        Candle {
            open_time,
            close_time: open_time + 59_999,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            base_volume: 100.0,
            quote_volume: 200.0,
            taker_buy_quote_volume: 120.0,
            is_closed,
        }
    }

    fn sample_ticker(symbol: &str, price: f64, qv: f64) -> Ticker {
        Ticker {
            symbol: symbol.into(),
            last_price: price,
            bid: price - 0.5,
            ask: price + 0.5,
            price_change_pct_24h: 1.0,
            high_24h: price + 10.0,
            low_24h: price - 10.0,
            quote_volume_24h: qv,
        }
    }

    #[test]
    fn capacity_invariant_holds() {
        let store = WindowStore::new(3);
        for i in 0..10 {
            store.apply_candle("BTCUSDT", sample_candle(i * 60_000, 100.0 + i as f64, true));
            assert!(store.window_len("BTCUSDT") <= 3);
        }
        assert_eq!(store.window_len("BTCUSDT"), 3);
    }

    #[test]
    fn eviction_is_fifo() {
        // Closes [10, 11, 9] at capacity 3, then a 4th close 12 arrives
        // closed: window becomes [11, 9, 12].
        let store = WindowStore::new(3);
        for (i, close) in [10.0, 11.0, 9.0, 12.0].iter().enumerate() {
            store.apply_candle("BTCUSDT", sample_candle(i as i64 * 60_000, *close, true));
        }
        let (candles, _) = store.snapshot("BTCUSDT").unwrap();
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        assert_eq!(closes, vec![11.0, 9.0, 12.0]);
    }

    #[test]
    fn open_candle_replaced_in_place() {
        let store = WindowStore::new(5);
        store.apply_candle("ETHUSDT", sample_candle(0, 50.0, false));
        store.apply_candle("ETHUSDT", sample_candle(0, 51.0, false));
        assert_eq!(store.window_len("ETHUSDT"), 1);

        // Finalizing the same bar still replaces rather than appends.
        store.apply_candle("ETHUSDT", sample_candle(0, 52.0, true));
        let (candles, _) = store.snapshot("ETHUSDT").unwrap();
        assert_eq!(candles.len(), 1);
        assert!((candles[0].close - 52.0).abs() < f64::EPSILON);
        assert!(candles[0].is_closed);
    }

    #[test]
    fn ticker_overwritten_wholesale() {
        let store = WindowStore::new(5);
        store.apply_ticker(sample_ticker("BTCUSDT", 100.0, 1000.0));
        store.apply_ticker(sample_ticker("BTCUSDT", 101.0, 2000.0));
        let ticker = store.ticker("BTCUSDT").unwrap();
        assert!((ticker.last_price - 101.0).abs() < f64::EPSILON);
        assert!((ticker.quote_volume_24h - 2000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn top_by_quote_volume_ranks_descending() {
        let store = WindowStore::new(5);
        store.apply_ticker(sample_ticker("AUSDT", 1.0, 500.0));
        store.apply_ticker(sample_ticker("BUSDT", 1.0, 2000.0));
        store.apply_ticker(sample_ticker("CUSDT", 1.0, 1000.0));
        store.ensure_symbol("DUSDT"); // no ticker yet — excluded

        let top = store.top_by_quote_volume(2);
        assert_eq!(top, vec!["BUSDT".to_string(), "CUSDT".to_string()]);
    }

    #[test]
    fn ensure_symbol_creates_empty_window() {
        let store = WindowStore::new(5);
        store.ensure_symbol("NEWUSDT");
        let (candles, ticker) = store.snapshot("NEWUSDT").unwrap();
        assert!(candles.is_empty());
        assert!(ticker.is_none());
        assert!(!store.active_symbols().contains(&"NEWUSDT".to_string()));
    }

    #[test]
    fn backfill_only_fills_empty_window() {
        let store = WindowStore::new(5);
        store.apply_candle("BTCUSDT", sample_candle(0, 100.0, true));
        store.backfill(
            "BTCUSDT",
            vec![sample_candle(60_000, 1.0, true), sample_candle(120_000, 2.0, true)],
        );
        // Live candle wins; backfill ignored.
        assert_eq!(store.window_len("BTCUSDT"), 1);

        store.backfill("ETHUSDT", vec![sample_candle(0, 1.0, true)]);
        assert_eq!(store.window_len("ETHUSDT"), 1);
    }

    #[test]
    fn spread_requires_both_sides() {
        let mut ticker = sample_ticker("BTCUSDT", 100.0, 1.0);
        assert!((ticker.spread().unwrap() - 1.0).abs() < 1e-12);
        ticker.bid = 0.0;
        assert!(ticker.spread().is_none());
    }
}
