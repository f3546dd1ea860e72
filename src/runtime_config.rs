// =============================================================================
// Runtime Configuration — JSON settings with atomic save
// =============================================================================
//
// Every tunable of the pipeline lives here. Persistence uses an atomic
// tmp + rename pattern to prevent corruption on crash. All fields carry
// `#[serde(default)]` so that adding new fields never breaks loading an
// older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_quote_currencies() -> Vec<String> {
    ["USDT", "USDC", "FDUSD", "BNB", "BTC"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_window_capacity() -> usize {
    250
}

fn default_candle_top_n() -> usize {
    200
}

fn default_rsi_period() -> usize {
    14
}

fn default_compute_interval_secs() -> u64 {
    5
}

fn default_flush_interval_secs() -> u64 {
    10
}

fn default_batch_cap() -> usize {
    200
}

fn default_heartbeat_secs() -> u64 {
    10
}

fn default_snapshot_page_size() -> usize {
    500
}

fn default_universe_refresh_secs() -> u64 {
    1800
}

fn default_kline_refresh_secs() -> u64 {
    900
}

fn default_read_timeout_secs() -> u64 {
    60
}

fn default_database_path() -> String {
    "meridian.db".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the screener pipeline.
///
/// Every field has a serde default so that older JSON files missing new
/// fields still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Symbol universe ----------------------------------------------------
    /// Quote currencies to track; symbols with any other quote are ignored.
    #[serde(default = "default_quote_currencies")]
    pub quote_currencies: Vec<String>,

    /// Maximum candles retained per symbol window.
    #[serde(default = "default_window_capacity")]
    pub window_capacity: usize,

    /// Number of top-volume symbols subscribed to per-symbol candle streams.
    #[serde(default = "default_candle_top_n")]
    pub candle_top_n: usize,

    // --- Metrics ------------------------------------------------------------
    /// RSI lookback period (Wilder's smoothing).
    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,

    /// Seconds between metric computation passes over the active universe.
    #[serde(default = "default_compute_interval_secs")]
    pub compute_interval_secs: u64,

    // --- Persistence --------------------------------------------------------
    /// Seconds between persistence flush ticks.
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Maximum symbols upserted per flush tick; excess carries to the next.
    #[serde(default = "default_batch_cap")]
    pub batch_cap: usize,

    /// SQLite database file path.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    // --- Subscribers --------------------------------------------------------
    /// Seconds between server heartbeats to each subscriber.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Default (and maximum) rows per snapshot chunk.
    #[serde(default = "default_snapshot_page_size")]
    pub snapshot_page_size: usize,

    /// API bind address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    // --- Exchange connection ------------------------------------------------
    /// Seconds between symbol-universe refreshes from exchange metadata.
    #[serde(default = "default_universe_refresh_secs")]
    pub universe_refresh_secs: u64,

    /// Seconds between kline subscription-set refreshes (reconnects with the
    /// new top-N set).
    #[serde(default = "default_kline_refresh_secs")]
    pub kline_refresh_secs: u64,

    /// Liveness timeout: a stream with no frame for this long is torn down.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            quote_currencies: default_quote_currencies(),
            window_capacity: default_window_capacity(),
            candle_top_n: default_candle_top_n(),
            rsi_period: default_rsi_period(),
            compute_interval_secs: default_compute_interval_secs(),
            flush_interval_secs: default_flush_interval_secs(),
            batch_cap: default_batch_cap(),
            database_path: default_database_path(),
            heartbeat_secs: default_heartbeat_secs(),
            snapshot_page_size: default_snapshot_page_size(),
            bind_addr: default_bind_addr(),
            universe_refresh_secs: default_universe_refresh_secs(),
            kline_refresh_secs: default_kline_refresh_secs(),
            read_timeout_secs: default_read_timeout_secs(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            quotes = ?config.quote_currencies,
            top_n = config.candle_top_n,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}
