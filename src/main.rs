// =============================================================================
// Meridian Screener — Main Entry Point
// =============================================================================
//
// Pipeline: Binance streams -> window store -> metrics -> SQLite upsert ->
// per-tier WebSocket fan-out. Every stage is an independent task joined by
// bounded channels; the batcher drains on shutdown before the process exits.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod binance;
mod fanout;
mod ingest;
mod metrics;
mod persist;
mod runtime_config;
mod types;
mod window;

use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::binance::BinanceClient;
use crate::metrics::MetricsEngine;
use crate::persist::PersistenceBatcher;
use crate::runtime_config::RuntimeConfig;

const CONFIG_PATH: &str = "runtime_config.json";
const SNAPSHOT_CHANNEL_CAPACITY: usize = 4096;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Screener — Starting Up                   ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // Deployment-level overrides from the environment.
    if let Ok(addr) = std::env::var("MERIDIAN_BIND_ADDR") {
        config.bind_addr = addr;
    }
    if let Ok(path) = std::env::var("MERIDIAN_DB_PATH") {
        config.database_path = path;
    }

    info!(
        quotes = ?config.quote_currencies,
        window_capacity = config.window_capacity,
        candle_top_n = config.candle_top_n,
        "Pipeline configuration"
    );

    // ── 2. Shared state & database ───────────────────────────────────────
    let state = Arc::new(AppState::new(config.clone()));

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&format!("sqlite://{}?mode=rwc", config.database_path))
        .await?;
    persist::init_schema(&pool).await?;

    let client = BinanceClient::default();

    // ── 3. Symbol universe (initial seed + periodic refresh) ─────────────
    match client.get_trading_symbols(&config.quote_currencies).await {
        Ok(symbols) => {
            for symbol in &symbols {
                state.window_store.ensure_symbol(symbol);
            }
            info!(count = symbols.len(), "symbol universe seeded");
        }
        Err(e) => {
            // Non-fatal: the ticker stream registers symbols as they tick.
            warn!(error = %e, "initial universe fetch failed");
        }
    }

    {
        let state = state.clone();
        let client = client.clone();
        let mut shutdown = state.shutdown_rx();
        tokio::spawn(async move {
            let refresh = Duration::from_secs(state.runtime_config.read().universe_refresh_secs);
            let mut interval = tokio::time::interval(refresh);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let quotes = state.runtime_config.read().quote_currencies.clone();
                        match client.get_trading_symbols(&quotes).await {
                            Ok(symbols) => {
                                for symbol in &symbols {
                                    state.window_store.ensure_symbol(symbol);
                                }
                                info!(count = symbols.len(), "symbol universe refreshed");
                            }
                            Err(e) => warn!(error = %e, "universe refresh failed"),
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    // ── 4. Ingest streams ────────────────────────────────────────────────
    {
        let state = state.clone();
        let shutdown = state.shutdown_rx();
        tokio::spawn(async move {
            ingest::ticker_stream::supervise(state, shutdown).await;
        });
    }
    {
        let state = state.clone();
        let client = client.clone();
        let shutdown = state.shutdown_rx();
        tokio::spawn(async move {
            ingest::kline_stream::supervise(state, client, shutdown).await;
        });
    }
    info!("ingest streams launched");

    // ── 5. Compute loop ──────────────────────────────────────────────────
    let (snapshot_tx, snapshot_rx) = mpsc::channel(SNAPSHOT_CHANNEL_CAPACITY);
    {
        let state = state.clone();
        let mut shutdown = state.shutdown_rx();
        tokio::spawn(async move {
            let (period, rsi_period) = {
                let cfg = state.runtime_config.read();
                (Duration::from_secs(cfg.compute_interval_secs), cfg.rsi_period)
            };
            let engine = MetricsEngine::new(rsi_period);
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        for symbol in state.window_store.active_symbols() {
                            let Some((candles, ticker)) = state.window_store.snapshot(&symbol)
                            else {
                                continue;
                            };
                            let snap = engine.compute(&symbol, &candles, ticker.as_ref());
                            // Back-pressure: a full channel drops this pass for
                            // the symbol; the next tick recomputes from scratch.
                            if snapshot_tx.try_send(Arc::new(snap)).is_err() {
                                warn!(symbol = %symbol, "snapshot channel full, dropping");
                            }
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    // ── 6. Persistence batcher ───────────────────────────────────────────
    let batcher_handle = {
        let state = state.clone();
        let shutdown = state.shutdown_rx();
        let batcher = PersistenceBatcher::new(pool, snapshot_rx);
        tokio::spawn(async move {
            batcher.run(state, shutdown).await;
        })
    };

    // ── 7. API server ────────────────────────────────────────────────────
    {
        let state = state.clone();
        let bind_addr = state.runtime_config.read().bind_addr.clone();
        let mut shutdown = state.shutdown_rx();
        tokio::spawn(async move {
            let app = api::rest::router(state);
            let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
                Ok(l) => l,
                Err(e) => {
                    error!(addr = %bind_addr, error = %e, "failed to bind API server");
                    return;
                }
            };
            info!(addr = %bind_addr, "API server listening");
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            });
            if let Err(e) = serve.await {
                error!(error = %e, "API server failed");
            }
        });
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received, stopping gracefully");

    state.trigger_shutdown();

    // The batcher performs a final flush before exiting.
    if let Err(e) = batcher_handle.await {
        error!(error = %e, "persistence batcher task failed");
    }

    if let Err(e) = state.runtime_config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("Meridian Screener shut down complete.");
    Ok(())
}
