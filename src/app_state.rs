// =============================================================================
// Central Application State — Meridian Screener
// =============================================================================
//
// The single source of truth for the pipeline. All subsystems hold Arc
// references to their own state; AppState ties them together and backs the
// health/stats API.
//
// Thread safety:
//   - Atomic counters for lock-free pipeline statistics.
//   - parking_lot::RwLock for the runtime config.
//   - Arc wrappers for subsystems that manage their own interior mutability.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;

use crate::fanout::FanoutHub;
use crate::runtime_config::RuntimeConfig;
use crate::window::WindowStore;

// =============================================================================
// Pipeline Statistics
// =============================================================================

/// Lock-free counters updated by the ingest, persistence and compute tasks.
#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Ticker-array frames received from the exchange.
    pub ticker_frames: AtomicU64,
    /// Individual ticker updates applied to the store.
    pub ticker_updates: AtomicU64,
    /// Kline events applied to the store.
    pub kline_events: AtomicU64,
    /// Messages that failed to parse and were dropped.
    pub parse_errors: AtomicU64,
    /// Successful persistence flushes.
    pub flush_count: AtomicU64,
    /// Batches dropped after exhausting write retries.
    pub flush_errors: AtomicU64,
    /// Stream reconnects (either stream).
    pub reconnects: AtomicU64,
}

/// Serializable snapshot of [`PipelineStats`] for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub ticker_frames: u64,
    pub ticker_updates: u64,
    pub kline_events: u64,
    pub parse_errors: u64,
    pub flush_count: u64,
    pub flush_errors: u64,
    pub reconnects: u64,
    pub tracked_symbols: usize,
    pub active_symbols: usize,
    pub uptime_secs: i64,
}

// =============================================================================
// AppState
// =============================================================================

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    /// Rolling candle windows + latest tickers, keyed by symbol.
    pub window_store: Arc<WindowStore>,
    /// Per-tier broadcast hub and latest-snapshot cache.
    pub fanout: Arc<FanoutHub>,
    /// Runtime configuration (reloadable).
    pub runtime_config: RwLock<RuntimeConfig>,
    /// Pipeline counters.
    pub stats: PipelineStats,
    /// Process start time (for uptime reporting).
    pub started_at: DateTime<Utc>,
    /// Shutdown signal; flipped to `true` exactly once.
    shutdown_tx: watch::Sender<bool>,
}

impl AppState {
    pub fn new(config: RuntimeConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            window_store: Arc::new(WindowStore::new(config.window_capacity)),
            fanout: Arc::new(FanoutHub::new()),
            runtime_config: RwLock::new(config),
            stats: PipelineStats::default(),
            started_at: Utc::now(),
            shutdown_tx,
        }
    }

    /// A fresh receiver on the shutdown signal.
    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Signal every task to stop.
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Point-in-time stats snapshot for the stats endpoint.
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            ticker_frames: self.stats.ticker_frames.load(Ordering::Relaxed),
            ticker_updates: self.stats.ticker_updates.load(Ordering::Relaxed),
            kline_events: self.stats.kline_events.load(Ordering::Relaxed),
            parse_errors: self.stats.parse_errors.load(Ordering::Relaxed),
            flush_count: self.stats.flush_count.load(Ordering::Relaxed),
            flush_errors: self.stats.flush_errors.load(Ordering::Relaxed),
            reconnects: self.stats.reconnects.load(Ordering::Relaxed),
            tracked_symbols: self.window_store.symbol_count(),
            active_symbols: self.window_store.active_symbols().len(),
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
        }
    }
}
