// =============================================================================
// Persistence Batcher — dedup, batch and upsert metric snapshots into SQLite
// =============================================================================
//
// Snapshots arrive over a bounded channel from the compute tick. Between
// flush ticks they are coalesced per symbol (latest wins), so the write
// volume is bounded by the universe size, not the compute rate. Each flush
// drains up to `batch_cap` symbols inside one transaction; the overflow
// stays buffered for the next tick. A batch that still fails after retries
// is dropped — the next compute pass regenerates fresher data anyway.
//
// Schema and upsert SQL are generated from `Timeframe::ALL`, so adding a
// timeframe extends the table without touching this module.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::metrics::{FrameMetrics, MetricSnapshot};
use crate::types::Timeframe;

const TABLE: &str = "screener_metrics";
const WRITE_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Fixed (non-timeframe) columns after the `symbol` primary key.
const BASE_COLUMNS: [&str; 9] = [
    "as_of",
    "last_price",
    "price_change_pct_24h",
    "high_24h",
    "low_24h",
    "quote_volume_24h",
    "bid",
    "ask",
    "spread",
];

/// Per-timeframe column suffixes, in bind order.
const FRAME_SUFFIXES: [&str; 9] = [
    "r_pct", "high", "low", "range_pct", "vol", "bv", "sv", "nv", "rsi",
];

/// All non-key column names in bind order.
fn metric_columns() -> Vec<String> {
    let mut cols: Vec<String> = BASE_COLUMNS.iter().map(|c| c.to_string()).collect();
    for tf in Timeframe::ALL {
        for suffix in FRAME_SUFFIXES {
            cols.push(format!("{}_{}", tf.label(), suffix));
        }
    }
    cols
}

/// CREATE TABLE IF NOT EXISTS statement for the metrics table.
pub fn create_table_sql() -> String {
    let cols: Vec<String> = metric_columns()
        .into_iter()
        .map(|c| {
            if c == "as_of" {
                format!("{c} INTEGER NOT NULL")
            } else {
                format!("{c} REAL")
            }
        })
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {TABLE} (symbol TEXT PRIMARY KEY, {})",
        cols.join(", ")
    )
}

/// Idempotent single-row upsert keyed on symbol.
fn upsert_sql() -> String {
    let cols = metric_columns();
    let placeholders: Vec<&str> = std::iter::repeat("?").take(cols.len() + 1).collect();
    let updates: Vec<String> = cols.iter().map(|c| format!("{c} = excluded.{c}")).collect();
    format!(
        "INSERT INTO {TABLE} (symbol, {}) VALUES ({}) ON CONFLICT(symbol) DO UPDATE SET {}",
        cols.join(", "),
        placeholders.join(", "),
        updates.join(", ")
    )
}

/// Create the metrics table if it does not exist.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(&create_table_sql())
        .execute(pool)
        .await
        .context("failed to create metrics table")?;
    info!(table = TABLE, "database schema ready");
    Ok(())
}

/// Remove up to `cap` snapshots from `buffer` in deterministic (sorted
/// symbol) order. Whatever exceeds the cap stays buffered.
pub fn drain_batch(
    buffer: &mut HashMap<String, Arc<MetricSnapshot>>,
    cap: usize,
) -> Vec<Arc<MetricSnapshot>> {
    let mut symbols: Vec<String> = buffer.keys().cloned().collect();
    symbols.sort();
    symbols.truncate(cap);

    symbols
        .into_iter()
        .filter_map(|sym| buffer.remove(&sym))
        .collect()
}

// =============================================================================
// PersistenceBatcher
// =============================================================================

pub struct PersistenceBatcher {
    pool: SqlitePool,
    rx: mpsc::Receiver<Arc<MetricSnapshot>>,
    buffer: HashMap<String, Arc<MetricSnapshot>>,
}

impl PersistenceBatcher {
    pub fn new(pool: SqlitePool, rx: mpsc::Receiver<Arc<MetricSnapshot>>) -> Self {
        Self {
            pool,
            rx,
            buffer: HashMap::new(),
        }
    }

    /// Run until shutdown: buffer incoming snapshots, flush on the interval,
    /// publish each flushed batch to the fan-out hub.
    pub async fn run(mut self, state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
        let (flush_interval, batch_cap) = {
            let cfg = state.runtime_config.read();
            (Duration::from_secs(cfg.flush_interval_secs), cfg.batch_cap)
        };

        let mut ticker = tokio::time::interval(flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe = self.rx.recv() => {
                    match maybe {
                        Some(snap) => {
                            // Latest snapshot per symbol wins.
                            self.buffer.insert(snap.symbol.clone(), snap);
                        }
                        None => {
                            warn!("snapshot channel closed, flushing and stopping");
                            self.flush(&state, batch_cap).await;
                            return;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.flush(&state, batch_cap).await;
                }
                _ = shutdown.changed() => {
                    info!("persistence batcher shutting down, final flush");
                    self.flush(&state, batch_cap).await;
                    return;
                }
            }
        }
    }

    async fn flush(&mut self, state: &Arc<AppState>, batch_cap: usize) {
        let batch = drain_batch(&mut self.buffer, batch_cap);
        if batch.is_empty() {
            return;
        }

        match write_batch_with_retry(&self.pool, &batch).await {
            Ok(()) => {
                state.stats.flush_count.fetch_add(1, Ordering::Relaxed);
                debug!(
                    symbols = batch.len(),
                    buffered = self.buffer.len(),
                    "batch flushed"
                );
                state.fanout.publish(&batch);
            }
            Err(e) => {
                state.stats.flush_errors.fetch_add(1, Ordering::Relaxed);
                error!(
                    error = %e,
                    symbols = batch.len(),
                    "dropping batch after exhausted write retries"
                );
            }
        }
    }
}

/// Write one batch in a single transaction, retrying transient failures with
/// exponential backoff.
async fn write_batch_with_retry(pool: &SqlitePool, batch: &[Arc<MetricSnapshot>]) -> Result<()> {
    let mut delay = RETRY_BASE_DELAY;
    let mut last_err = None;

    for attempt in 1..=WRITE_RETRIES {
        match write_batch(pool, batch).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(attempt, error = %e, "batch write failed");
                last_err = Some(e);
                if attempt < WRITE_RETRIES {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("batch write failed")))
}

async fn write_batch(pool: &SqlitePool, batch: &[Arc<MetricSnapshot>]) -> Result<()> {
    let sql = upsert_sql();
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    for snap in batch {
        let mut query = sqlx::query(&sql)
            .bind(&snap.symbol)
            .bind(snap.as_of)
            .bind(snap.last_price)
            .bind(snap.price_change_pct_24h)
            .bind(snap.high_24h)
            .bind(snap.low_24h)
            .bind(snap.quote_volume_24h)
            .bind(snap.bid)
            .bind(snap.ask)
            .bind(snap.spread);

        for tf in Timeframe::ALL {
            // Snapshots from the engine carry every timeframe; a partial one
            // still binds a full row of neutral columns.
            let fallback = FrameMetrics::empty(tf);
            let frame = snap.frame(tf).unwrap_or(&fallback);
            query = query
                .bind(frame.return_pct)
                .bind(frame.high)
                .bind(frame.low)
                .bind(frame.range_pct)
                .bind(frame.volume)
                .bind(frame.buy_volume)
                .bind(frame.sell_volume)
                .bind(frame.net_volume)
                .bind(frame.rsi);
        }

        query
            .execute(&mut *tx)
            .await
            .with_context(|| format!("upsert failed for {}", snap.symbol))?;
    }

    tx.commit().await.context("failed to commit batch")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot(symbol: &str, price: f64) -> Arc<MetricSnapshot> {
        Arc::new(MetricSnapshot {
            symbol: symbol.to_string(),
            as_of: 1_700_000_000_000,
            last_price: price,
            price_change_pct_24h: 0.0,
            high_24h: price,
            low_24h: price,
            quote_volume_24h: 0.0,
            bid: price,
            ask: price,
            spread: None,
            frames: Timeframe::ALL.iter().map(|&tf| FrameMetrics::empty(tf)).collect(),
        })
    }

    #[test]
    fn drain_respects_cap_and_carries_over() {
        // 500 buffered symbols, cap 100: exactly 100 drained, 400 remain.
        let mut buffer = HashMap::new();
        for i in 0..500 {
            let sym = format!("SYM{i:03}USDT");
            buffer.insert(sym.clone(), sample_snapshot(&sym, i as f64));
        }

        let batch = drain_batch(&mut buffer, 100);
        assert_eq!(batch.len(), 100);
        assert_eq!(buffer.len(), 400);

        // No snapshot lost or duplicated across the carryover.
        let batch2 = drain_batch(&mut buffer, 100);
        assert_eq!(batch2.len(), 100);
        assert_eq!(buffer.len(), 300);
        let first: std::collections::HashSet<_> =
            batch.iter().map(|s| s.symbol.clone()).collect();
        assert!(batch2.iter().all(|s| !first.contains(&s.symbol)));
    }

    #[test]
    fn drain_order_is_deterministic() {
        let mut a = HashMap::new();
        let mut b = HashMap::new();
        for sym in ["CUSDT", "AUSDT", "BUSDT"] {
            a.insert(sym.to_string(), sample_snapshot(sym, 1.0));
            b.insert(sym.to_string(), sample_snapshot(sym, 1.0));
        }
        let batch_a: Vec<String> = drain_batch(&mut a, 10).iter().map(|s| s.symbol.clone()).collect();
        let batch_b: Vec<String> = drain_batch(&mut b, 10).iter().map(|s| s.symbol.clone()).collect();
        assert_eq!(batch_a, batch_b);
        assert_eq!(batch_a, vec!["AUSDT", "BUSDT", "CUSDT"]);
    }

    #[test]
    fn latest_wins_in_buffer() {
        let mut buffer = HashMap::new();
        for price in [100.0, 101.0, 102.0] {
            let snap = sample_snapshot("BTCUSDT", price);
            buffer.insert(snap.symbol.clone(), snap);
        }
        let batch = drain_batch(&mut buffer, 10);
        assert_eq!(batch.len(), 1);
        assert!((batch[0].last_price - 102.0).abs() < f64::EPSILON);
    }

    #[test]
    fn upsert_sql_covers_every_column() {
        let sql = upsert_sql();
        assert!(sql.contains("ON CONFLICT(symbol) DO UPDATE SET"));
        for tf in Timeframe::ALL {
            for suffix in FRAME_SUFFIXES {
                let col = format!("{}_{}", tf.label(), suffix);
                assert!(sql.contains(&col), "missing column {col}");
            }
        }
        // One placeholder per column plus the symbol key.
        let expected = metric_columns().len() + 1;
        assert_eq!(sql.matches('?').count(), expected);
    }

    #[test]
    fn create_table_sql_is_well_formed() {
        let sql = create_table_sql();
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS screener_metrics"));
        assert!(sql.contains("symbol TEXT PRIMARY KEY"));
        assert!(sql.contains("as_of INTEGER NOT NULL"));
        assert!(sql.contains("m60_rsi REAL"));
    }

    #[tokio::test]
    async fn schema_and_upsert_round_trip() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        init_schema(&pool).await.unwrap();

        let batch = vec![sample_snapshot("BTCUSDT", 100.0)];
        write_batch(&pool, &batch).await.unwrap();

        // Second write with a newer price must update, not duplicate.
        let batch = vec![sample_snapshot("BTCUSDT", 105.0)];
        write_batch(&pool, &batch).await.unwrap();

        let row: (i64, f64) =
            sqlx::query_as("SELECT COUNT(*), MAX(last_price) FROM screener_metrics")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(row.0, 1);
        assert!((row.1 - 105.0).abs() < f64::EPSILON);
    }
}
