// =============================================================================
// Binance REST Client — public market-data endpoints
// =============================================================================
//
// Only unauthenticated endpoints are consumed: exchange metadata for the
// symbol universe and klines for window backfill. No request signing.
// =============================================================================

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::window::Candle;

/// Binance public REST client.
#[derive(Clone)]
pub struct BinanceClient {
    base_url: String,
    client: reqwest::Client,
}

impl Default for BinanceClient {
    fn default() -> Self {
        Self::new("https://api.binance.com")
    }
}

impl BinanceClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Exchange metadata
    // -------------------------------------------------------------------------

    /// GET /api/v3/exchangeInfo — the active symbol universe.
    ///
    /// Returns the TRADING symbols whose quote asset is in `quotes`, so a
    /// newly listed pair is registered before its first candle arrives.
    #[instrument(skip(self, quotes), name = "binance::get_trading_symbols")]
    pub async fn get_trading_symbols(&self, quotes: &[String]) -> Result<Vec<String>> {
        let url = format!("{}/api/v3/exchangeInfo", self.base_url);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/exchangeInfo request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse exchangeInfo response")?;

        if !status.is_success() {
            anyhow::bail!("Binance GET /api/v3/exchangeInfo returned {}: {}", status, body);
        }

        let raw = body["symbols"]
            .as_array()
            .context("exchangeInfo response missing 'symbols' array")?;

        let mut symbols = Vec::new();
        for entry in raw {
            let status = entry["status"].as_str().unwrap_or("");
            let quote = entry["quoteAsset"].as_str().unwrap_or("");
            let symbol = entry["symbol"].as_str().unwrap_or("");

            if status == "TRADING"
                && !symbol.is_empty()
                && quotes.iter().any(|q| q == quote)
            {
                symbols.push(symbol.to_string());
            }
        }

        debug!(count = symbols.len(), "trading symbols fetched");
        Ok(symbols)
    }

    // -------------------------------------------------------------------------
    // Klines (window backfill)
    // -------------------------------------------------------------------------

    /// GET /api/v3/klines (1m) — backfill candles for one symbol.
    ///
    /// Array indices:
    ///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
    ///   [6] closeTime, [7] quoteAssetVolume, [8] numberOfTrades,
    ///   [9] takerBuyBaseVolume, [10] takerBuyQuoteVolume
    #[instrument(skip(self), name = "binance::get_klines")]
    pub async fn get_klines(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval=1m&limit={}",
            self.base_url, symbol, limit
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/klines request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse klines response")?;

        if !status.is_success() {
            anyhow::bail!("Binance GET /api/v3/klines returned {}: {}", status, body);
        }

        let raw = body.as_array().context("klines response is not an array")?;

        let mut candles = Vec::with_capacity(raw.len());

        for entry in raw {
            let arr = match entry.as_array() {
                Some(a) if a.len() >= 11 => a,
                _ => {
                    warn!("skipping malformed kline entry");
                    continue;
                }
            };

            candles.push(Candle {
                open_time: arr[0].as_i64().unwrap_or(0),
                open: parse_str_f64(&arr[1])?,
                high: parse_str_f64(&arr[2])?,
                low: parse_str_f64(&arr[3])?,
                close: parse_str_f64(&arr[4])?,
                base_volume: parse_str_f64(&arr[5])?,
                close_time: arr[6].as_i64().unwrap_or(0),
                quote_volume: parse_str_f64(&arr[7])?,
                taker_buy_quote_volume: parse_str_f64(&arr[10])?,
                is_closed: true,
            });
        }

        // The newest REST kline may still be in progress.
        if let Some(last) = candles.last_mut() {
            if last.close_time > chrono::Utc::now().timestamp_millis() {
                last.is_closed = false;
            }
        }

        debug!(symbol, count = candles.len(), "klines fetched");
        Ok(candles)
    }
}

/// Parse a JSON value that may be either a string or a number into `f64`.
/// Binance sends numeric kline fields as JSON strings.
pub fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_str_f64_accepts_strings_and_numbers() {
        assert!((parse_str_f64(&serde_json::json!("37000.5")).unwrap() - 37000.5).abs() < 1e-9);
        assert!((parse_str_f64(&serde_json::json!(42.0)).unwrap() - 42.0).abs() < 1e-9);
        assert!(parse_str_f64(&serde_json::json!("not-a-number")).is_err());
        assert!(parse_str_f64(&serde_json::json!(null)).is_err());
    }
}
