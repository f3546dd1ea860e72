// =============================================================================
// Kline Stream — per-symbol 1m candles for the top-N volume universe
// =============================================================================
//
// Candle streams are subscribed per symbol, so coverage is limited to the
// top N symbols by 24h quote volume. The subscription set is recomputed on
// a fixed cadence; a refresh tears the connection down and reconnects with
// the new combined-stream URL. Symbols entering the set with an empty
// window are backfilled over REST before the stream attaches, so metric
// depth is available immediately.
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
use crate::binance::BinanceClient;
use crate::ingest::Backoff;
use crate::window::Candle;

const COMBINED_STREAM_BASE: &str = "wss://stream.binance.com:9443/stream?streams=";

/// Supervise the kline stream: pick the top-N set, backfill newcomers,
/// connect, consume until refresh/failure, repeat. Returns only on shutdown.
pub async fn supervise(
    state: Arc<AppState>,
    client: BinanceClient,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::standard();

    loop {
        if *shutdown.borrow() {
            return;
        }

        let (top_n, refresh_interval) = {
            let cfg = state.runtime_config.read();
            (cfg.candle_top_n, Duration::from_secs(cfg.kline_refresh_secs))
        };

        let symbols = state.window_store.top_by_quote_volume(top_n);
        if symbols.is_empty() {
            // Ticker stream hasn't populated the universe yet.
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
                _ = shutdown.changed() => return,
            }
        }

        backfill_missing(&state, &client, &symbols).await;

        let connected_at = Instant::now();
        match run_once(&state, &symbols, refresh_interval, &mut shutdown).await {
            Ok(StreamExit::Shutdown) => return,
            Ok(StreamExit::Refresh) => {
                // Planned reconnect with a fresh top-N set; no backoff.
                backoff.record_uptime(connected_at.elapsed());
                continue;
            }
            Err(e) => {
                error!(error = %e, "kline stream failed");
            }
        }

        backoff.record_uptime(connected_at.elapsed());
        state.stats.reconnects.fetch_add(1, Ordering::Relaxed);

        let delay = backoff.next_delay();
        info!(delay_secs = delay.as_secs(), "kline stream reconnecting");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return,
        }
    }
}

/// REST-backfill any subscribed symbol whose window is still empty. A failed
/// backfill is logged and skipped; the live stream will fill the window over
/// time regardless.
async fn backfill_missing(state: &Arc<AppState>, client: &BinanceClient, symbols: &[String]) {
    let capacity = state.runtime_config.read().window_capacity;

    for symbol in symbols {
        if state.window_store.window_len(symbol) > 0 {
            continue;
        }
        match client.get_klines(symbol, capacity).await {
            Ok(candles) => {
                state.window_store.backfill(symbol, candles);
            }
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "kline backfill failed");
            }
        }
    }
}

enum StreamExit {
    Shutdown,
    Refresh,
}

/// One connection lifetime over the combined stream for `symbols`.
async fn run_once(
    state: &Arc<AppState>,
    symbols: &[String],
    refresh_interval: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<StreamExit> {
    let read_timeout = {
        let cfg = state.runtime_config.read();
        Duration::from_secs(cfg.read_timeout_secs)
    };

    let url = combined_stream_url(symbols);
    info!(symbols = symbols.len(), "connecting to kline stream");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to kline stream")?;
    info!(symbols = symbols.len(), "kline stream connected");

    let (mut write, mut read) = ws_stream.split();
    let refresh = tokio::time::sleep(refresh_interval);
    tokio::pin!(refresh);

    loop {
        tokio::select! {
            msg = tokio::time::timeout(read_timeout, read.next()) => {
                match msg {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        handle_frame(state, &text);
                    }
                    Ok(Some(Ok(Message::Ping(payload)))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Ok(Some(Ok(Message::Close(_)))) => {
                        anyhow::bail!("kline stream closed by server");
                    }
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(e))) => {
                        return Err(e).context("kline stream read error");
                    }
                    Ok(None) => {
                        anyhow::bail!("kline stream ended");
                    }
                    Err(_) => {
                        anyhow::bail!(
                            "no kline frame for {}s, assuming dead connection",
                            read_timeout.as_secs()
                        );
                    }
                }
            }
            _ = &mut refresh => {
                info!("kline subscription set refresh due");
                let _ = write.send(Message::Close(None)).await;
                return Ok(StreamExit::Refresh);
            }
            _ = shutdown.changed() => {
                info!("kline stream shutting down");
                let _ = write.send(Message::Close(None)).await;
                return Ok(StreamExit::Shutdown);
            }
        }
    }
}

/// Combined-stream URL: `.../stream?streams=btcusdt@kline_1m/ethusdt@kline_1m`.
fn combined_stream_url(symbols: &[String]) -> String {
    let streams: Vec<String> = symbols
        .iter()
        .map(|s| format!("{}@kline_1m", s.to_lowercase()))
        .collect();
    format!("{}{}", COMBINED_STREAM_BASE, streams.join("/"))
}

/// Parse one combined-stream frame and apply the candle event.
fn handle_frame(state: &Arc<AppState>, text: &str) {
    let root: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "failed to parse kline frame");
            state.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    match parse_kline(&root["data"]) {
        Ok((symbol, candle)) => {
            state.window_store.apply_candle(&symbol, candle);
            state.stats.kline_events.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            warn!(error = %e, "dropping malformed kline event");
            state.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Parse a kline event payload.
///
/// Expected shape (abridged):
/// ```json
/// { "e": "kline", "s": "BTCUSDT",
///   "k": { "t": 1, "T": 59999, "o": "1", "h": "2", "l": "0.5", "c": "1.5",
///          "v": "100", "q": "150", "Q": "90", "x": false } }
/// ```
fn parse_kline(data: &serde_json::Value) -> Result<(String, Candle)> {
    let symbol = data["s"]
        .as_str()
        .context("missing field s")?
        .to_string();

    let k = &data["k"];
    let field = |key: &str| -> Result<f64> {
        k[key]
            .as_str()
            .with_context(|| format!("missing field k.{key}"))?
            .parse::<f64>()
            .with_context(|| format!("failed to parse field k.{key}"))
    };

    let candle = Candle {
        open_time: k["t"].as_i64().context("missing field k.t")?,
        close_time: k["T"].as_i64().context("missing field k.T")?,
        open: field("o")?,
        high: field("h")?,
        low: field("l")?,
        close: field("c")?,
        base_volume: field("v")?,
        quote_volume: field("q")?,
        taker_buy_quote_volume: field("Q")?,
        is_closed: k["x"].as_bool().context("missing field k.x")?,
    };

    Ok((symbol, candle))
}
