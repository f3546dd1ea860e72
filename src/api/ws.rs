// =============================================================================
// WebSocket Gateway — tiered subscriber connections
// =============================================================================
//
// Clients connect to `/api/v1/ws?token=<token>` and receive:
//   1. An immediate `ack` frame carrying the resolved tier.
//   2. `delta` frames forwarded from the tier's broadcast channel after
//      every persistence flush.
//   3. `heartbeat` frames on a fixed interval.
//
// Clients may request a full snapshot of the latest cached metrics at any
// time; the response is paged into `snapshot` chunks so a large universe
// never produces one oversized frame. A malformed request yields an `error`
// frame and the connection stays open.
//
// A subscriber that falls behind the broadcast ring observes `Lagged` and
// silently resumes from the newest frame — slow consumers shed frames, they
// never stall the pipeline.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use chrono::Utc;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::api::auth::resolve_tier;
use crate::app_state::AppState;
use crate::metrics::MetricSnapshot;
use crate::types::Tier;

// =============================================================================
// Query parameters and client requests
// =============================================================================

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// A parsed client frame. Only snapshot requests are recognised.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientRequest {
    RequestSnapshot {
        #[serde(default)]
        sort_by: Option<String>,
        #[serde(default)]
        sort_order: Option<String>,
        #[serde(default)]
        quote_currency: Option<String>,
        #[serde(default)]
        page_size: Option<usize>,
    },
}

// =============================================================================
// Upgrade handler
// =============================================================================

/// Axum handler for the WebSocket upgrade. The token only selects a tier;
/// it never rejects the connection.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let tier = resolve_tier(query.token.as_deref());
    info!(%tier, "WebSocket connection accepted, upgrading");
    ws.on_upgrade(move |socket| handle_connection(socket, state, tier))
}

// =============================================================================
// Connection loop
// =============================================================================

async fn handle_connection(socket: WebSocket, state: Arc<AppState>, tier: Tier) {
    let (sender, receiver) = socket.split();
    run_subscriber(sender, receiver, state, tier).await;
}

/// The per-subscriber loop, generic over the socket halves so teardown can
/// be exercised without a live upgrade. Returning drops the broadcast
/// receiver and the heartbeat timer with it; nothing owned by the
/// connection survives this function.
async fn run_subscriber<S, R>(mut sender: S, mut receiver: R, state: Arc<AppState>, tier: Tier)
where
    S: Sink<Message, Error = axum::Error> + Unpin,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let ack = serde_json::json!({ "type": "ack", "tier": tier });
    if sender.send(Message::Text(ack.to_string().into())).await.is_err() {
        return;
    }

    let heartbeat_secs = state.runtime_config.read().heartbeat_secs;
    let mut heartbeat = interval(Duration::from_secs(heartbeat_secs));
    heartbeat.tick().await; // first tick fires immediately; skip it

    let mut deltas = state.fanout.subscribe(tier);
    let mut shutdown = state.shutdown_rx();

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let frame = serde_json::json!({
                    "type": "heartbeat",
                    "ts": Utc::now().timestamp_millis(),
                });
                if sender.send(Message::Text(frame.to_string().into())).await.is_err() {
                    break;
                }
            }

            delta = deltas.recv() => {
                match delta {
                    Ok(frame) => {
                        if sender.send(Message::Text(frame.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(%tier, skipped, "subscriber lagged, frames dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if handle_client_frame(&mut sender, &state, tier, &text).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(%tier, "client closed connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(%tier, error = %e, "WebSocket receive error");
                        break;
                    }
                    None => break,
                }
            }

            _ = shutdown.changed() => {
                info!(%tier, "closing subscriber connection on shutdown");
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    debug!(%tier, "subscriber connection closed");
}

/// Handle one inbound text frame. Returns `Err` only on a dead socket;
/// protocol errors are reported to the client and the connection survives.
async fn handle_client_frame<S>(
    sender: &mut S,
    state: &Arc<AppState>,
    tier: Tier,
    text: &str,
) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    let request: ClientRequest = match serde_json::from_str(text) {
        Ok(req) => req,
        Err(e) => {
            debug!(error = %e, "malformed client frame");
            let frame = serde_json::json!({
                "type": "error",
                "message": "malformed request",
            });
            return sender.send(Message::Text(frame.to_string().into())).await;
        }
    };

    let ClientRequest::RequestSnapshot {
        sort_by,
        sort_order,
        quote_currency,
        page_size,
    } = request;

    let (allowed_quotes, max_page) = {
        let cfg = state.runtime_config.read();
        (cfg.quote_currencies.clone(), cfg.snapshot_page_size)
    };

    // Unknown quote currencies fall back to USDT rather than erroring.
    let quote = quote_currency
        .filter(|q| allowed_quotes.iter().any(|a| a == q))
        .unwrap_or_else(|| "USDT".to_string());

    let page_size = page_size.unwrap_or(max_page).clamp(1, max_page);

    let mut snapshots = state.fanout.snapshots_for_quote(&quote);
    sort_snapshots(
        &mut snapshots,
        sort_by.as_deref().unwrap_or("volume"),
        sort_order.as_deref().unwrap_or("desc"),
    );

    let total_count = snapshots.len();
    let total_chunks = total_count.div_ceil(page_size).max(1);

    for (index, chunk) in snapshots.chunks(page_size).enumerate() {
        let data: Vec<serde_json::Value> = chunk.iter().map(|s| s.project(tier)).collect();
        let frame = serde_json::json!({
            "type": "snapshot",
            "chunk": index + 1,
            "total_chunks": total_chunks,
            "total_count": total_count,
            "quote_currency": quote,
            "data": data,
        });
        sender.send(Message::Text(frame.to_string().into())).await?;
    }

    if total_count == 0 {
        // Still answer, so the client can tell an empty universe from a
        // dropped request.
        let frame = serde_json::json!({
            "type": "snapshot",
            "chunk": 1,
            "total_chunks": 1,
            "total_count": 0,
            "quote_currency": quote,
            "data": [],
        });
        sender.send(Message::Text(frame.to_string().into())).await?;
    }

    Ok(())
}

/// Sort cached snapshots by the requested key and order. Unknown keys fall
/// back to 24h quote volume.
fn sort_snapshots(snapshots: &mut [Arc<MetricSnapshot>], sort_by: &str, sort_order: &str) {
    let key = |s: &MetricSnapshot| -> f64 {
        match sort_by {
            "change" => s.price_change_pct_24h,
            "price" => s.last_price,
            _ => s.quote_volume_24h,
        }
    };

    snapshots.sort_by(|a, b| {
        let ord = key(a)
            .partial_cmp(&key(b))
            .unwrap_or(std::cmp::Ordering::Equal);
        if sort_order == "asc" {
            ord
        } else {
            ord.reverse()
        }
    });
}

// =============================================================================
// Tests
// =============================================================================
