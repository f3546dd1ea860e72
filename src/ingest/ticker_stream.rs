// =============================================================================
// Ticker Stream — all-symbol 24h ticker ingestion (!ticker@arr)
// =============================================================================
//
// One connection covers the entire exchange: the combined ticker stream
// pushes an array of per-symbol 24h statistics roughly once per second.
// Symbols outside the configured quote-currency allowlist are skipped;
// malformed entries are dropped and counted, never fatal.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::app_state::AppState;
use crate::ingest::Backoff;
use crate::types::has_supported_quote;
use crate::window::Ticker;

const TICKER_STREAM_URL: &str = "wss://stream.binance.com:9443/ws/!ticker@arr";

/// Supervise the ticker stream: connect, consume until failure, reconnect
/// with exponential backoff. Returns only on shutdown.
pub async fn supervise(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut backoff = Backoff::standard();

    loop {
        if *shutdown.borrow() {
            return;
        }

        let connected_at = Instant::now();
        match run_once(&state, &mut shutdown).await {
            Ok(()) => {
                // Clean exit only happens on shutdown.
                return;
            }
            Err(e) => {
                error!(error = %e, "ticker stream failed");
            }
        }

        backoff.record_uptime(connected_at.elapsed());
        state.stats.reconnects.fetch_add(1, Ordering::Relaxed);

        let delay = backoff.next_delay();
        info!(delay_secs = delay.as_secs(), "ticker stream reconnecting");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return,
        }
    }
}

/// One connection lifetime: consume frames until the stream dies, a read
/// stalls past the liveness timeout, or shutdown is signalled.
async fn run_once(state: &Arc<AppState>, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
    let read_timeout = {
        let cfg = state.runtime_config.read();
        Duration::from_secs(cfg.read_timeout_secs)
    };

    info!(url = TICKER_STREAM_URL, "connecting to ticker stream");
    let (ws_stream, _response) = connect_async(TICKER_STREAM_URL)
        .await
        .context("failed to connect to ticker stream")?;
    info!("ticker stream connected");

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = tokio::time::timeout(read_timeout, read.next()) => {
                match msg {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        handle_frame(state, &text);
                    }
                    Ok(Some(Ok(Message::Ping(payload)))) => {
                        // Server pings must be answered or it drops us.
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Ok(Some(Ok(Message::Close(_)))) => {
                        anyhow::bail!("ticker stream closed by server");
                    }
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(e))) => {
                        return Err(e).context("ticker stream read error");
                    }
                    Ok(None) => {
                        anyhow::bail!("ticker stream ended");
                    }
                    Err(_) => {
                        anyhow::bail!(
                            "no ticker frame for {}s, assuming dead connection",
                            read_timeout.as_secs()
                        );
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("ticker stream shutting down");
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
        }
    }
}

/// Parse one `!ticker@arr` frame and apply every well-formed, allowlisted
/// entry to the window store.
fn handle_frame(state: &Arc<AppState>, text: &str) {
    state.stats.ticker_frames.fetch_add(1, Ordering::Relaxed);

    let quotes = state.runtime_config.read().quote_currencies.clone();

    let root: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "failed to parse ticker frame");
            state.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    let Some(entries) = root.as_array() else {
        warn!("ticker frame is not an array");
        state.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
        return;
    };

    let mut applied = 0u64;
    for entry in entries {
        let symbol = entry["s"].as_str().unwrap_or("");
        if !has_supported_quote(symbol, &quotes) {
            continue;
        }

        match parse_ticker(entry) {
            Ok(ticker) => {
                state.window_store.apply_ticker(ticker);
                applied += 1;
            }
            Err(e) => {
                warn!(symbol, error = %e, "dropping malformed ticker entry");
                state.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    state.stats.ticker_updates.fetch_add(applied, Ordering::Relaxed);
}

/// Parse a single 24h ticker event.
///
/// Expected shape (abridged):
/// ```json
/// { "s": "BTCUSDT", "c": "37000.0", "P": "2.5", "h": "38000", "l": "36000",
///   "q": "12345678.0", "b": "36999.9", "a": "37000.1" }
/// ```
fn parse_ticker(entry: &serde_json::Value) -> Result<Ticker> {
    let field = |key: &str| -> Result<f64> {
        entry[key]
            .as_str()
            .with_context(|| format!("missing field {key}"))?
            .parse::<f64>()
            .with_context(|| format!("failed to parse field {key}"))
    };

    Ok(Ticker {
        symbol: entry["s"]
            .as_str()
            .context("missing field s")?
            .to_string(),
        last_price: field("c")?,
        price_change_pct_24h: field("P")?,
        high_24h: field("h")?,
        low_24h: field("l")?,
        quote_volume_24h: field("q")?,
        bid: field("b")?,
        ask: field("a")?,
    })
}
