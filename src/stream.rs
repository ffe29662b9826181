// ===============================
// src/stream.rs
// ===============================
//
// Private order stream (wss://stream.bybit.com/v5/private):
// - auth frame: {"op":"auth","args":[api_key, expires_ms, signature]}
//   where signature = HMAC-SHA256(secret, "GET/realtime{expires_ms}") hex
// - subscribe to the "order" topic once the auth ack arrives
// - app-level {"op":"ping"} every 20s keeps the session alive
// - reconnect with exponential backoff + jitter
//
// Fills and cancels reach the guard loop seconds before the next REST poll
// would see them; the loop itself stays correct without this stream.

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::bybit::{sign_payload, timestamp_ms};
use crate::domain::{parse_opt_dec, OrderStatus, OrderUpdate};
use crate::metrics::{STREAM_CONNECTED, STREAM_LAST_EVENT_TS, STREAM_RECONNECTS};

const PING_INTERVAL: Duration = Duration::from_secs(20);
const AUTH_WINDOW_MS: i64 = 10_000;

fn auth_request(api_key: &str, api_secret: &str, now_ms: i64) -> String {
    let expires = now_ms + AUTH_WINDOW_MS;
    let signature = sign_payload(api_secret, &format!("GET/realtime{}", expires));
    serde_json::json!({"op": "auth", "args": [api_key, expires, signature]}).to_string()
}

fn subscribe_request() -> String {
    serde_json::json!({"op": "subscribe", "args": ["order"]}).to_string()
}

/// 500ms doubling per attempt, capped at 32s. Jitter is added by the caller.
fn backoff_base_ms(attempt: u32) -> u64 {
    let shift = attempt.min(6);
    500u64.saturating_mul(1u64 << shift)
}

/// One row of the "order" topic payload.
fn parse_order_row(row: &serde_json::Value) -> Option<OrderUpdate> {
    let order_id = row.get("orderId")?.as_str()?.to_string();
    let symbol = row.get("symbol")?.as_str()?.to_string();
    let status = OrderStatus::parse(row.get("orderStatus").and_then(|v| v.as_str()).unwrap_or(""));
    let order_link_id = row
        .get("orderLinkId")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let avg_price = row.get("avgPrice").and_then(|v| v.as_str()).and_then(parse_opt_dec);
    let cum_exec_qty = row.get("cumExecQty").and_then(|v| v.as_str()).and_then(parse_opt_dec);
    Some(OrderUpdate { order_id, order_link_id, symbol, status, avg_price, cum_exec_qty })
}

pub async fn run(ws_url: String, api_key: String, api_secret: String, tx: mpsc::Sender<OrderUpdate>) {
    // tungstenite takes the address as &str; Url is only for early validation
    if let Err(e) = Url::parse(&ws_url) {
        error!(?e, %ws_url, "bad ws url");
        return;
    }

    let mut attempt: u32 = 0;
    loop {
        info!(%ws_url, "connecting private order stream");
        match connect_async(ws_url.as_str()).await {
            Ok((ws, _resp)) => {
                let (mut write, mut read) = ws.split();
                let auth = auth_request(&api_key, &api_secret, timestamp_ms());
                if let Err(e) = write.send(Message::Text(auth)).await {
                    error!(?e, "auth send failed");
                } else {
                    attempt = 0;
                    let mut ping = interval(PING_INTERVAL);
                    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

                    loop {
                        tokio::select! {
                            _ = ping.tick() => {
                                if let Err(e) = write.send(Message::Text(r#"{"op":"ping"}"#.to_string())).await {
                                    error!(?e, "ping send failed");
                                    break;
                                }
                            }

                            frame = read.next() => {
                                match frame {
                                    Some(Ok(m)) if m.is_text() => {
                                        let txt = match m.into_text() {
                                            Ok(t) => t,
                                            Err(e) => {
                                                warn!(?e, "failed to read text frame");
                                                continue;
                                            }
                                        };
                                        STREAM_LAST_EVENT_TS.set(timestamp_ms() / 1000);
                                        let v: serde_json::Value = match serde_json::from_str(&txt) {
                                            Ok(v) => v,
                                            Err(e) => {
                                                warn!(?e, "unparseable stream frame");
                                                continue;
                                            }
                                        };

                                        if let Some(op) = v.get("op").and_then(|o| o.as_str()) {
                                            let success = v.get("success").and_then(|s| s.as_bool()).unwrap_or(true);
                                            match op {
                                                "auth" if success => {
                                                    debug!("stream authenticated, subscribing to orders");
                                                    if let Err(e) = write.send(Message::Text(subscribe_request())).await {
                                                        error!(?e, "subscribe send failed");
                                                        break;
                                                    }
                                                }
                                                "auth" => {
                                                    error!(ret_msg = %v.get("ret_msg").and_then(|m| m.as_str()).unwrap_or(""), "stream auth rejected");
                                                    break;
                                                }
                                                "subscribe" if success => {
                                                    STREAM_CONNECTED.set(1);
                                                    info!("order stream live");
                                                }
                                                "subscribe" => {
                                                    error!(ret_msg = %v.get("ret_msg").and_then(|m| m.as_str()).unwrap_or(""), "order subscribe rejected");
                                                    break;
                                                }
                                                "pong" | "ping" => {
                                                    debug!("stream pong");
                                                }
                                                other => {
                                                    debug!(op = other, "ignoring stream control frame");
                                                }
                                            }
                                            continue;
                                        }

                                        if v.get("topic").and_then(|t| t.as_str()) == Some("order") {
                                            if let Some(rows) = v.get("data").and_then(|d| d.as_array()) {
                                                for row in rows {
                                                    if let Some(upd) = parse_order_row(row) {
                                                        if let Err(e) = tx.send(upd).await {
                                                            error!(?e, "order update send failed");
                                                        }
                                                    }
                                                }
                                            }
                                        }
                                    }
                                    Some(Ok(m)) if m.is_close() => {
                                        info!("order stream closed by server");
                                        break;
                                    }
                                    Some(Ok(_)) => {
                                        // ignore binary/protocol frames
                                    }
                                    Some(Err(e)) => {
                                        error!(?e, "ws read error");
                                        break;
                                    }
                                    None => {
                                        info!("order stream disconnected, will reconnect…");
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
            }
            Err(e) => {
                error!(?e, "connect failed");
            }
        }

        STREAM_CONNECTED.set(0);
        STREAM_RECONNECTS.inc();

        // Exponential backoff + jitter
        attempt = attempt.saturating_add(1);
        let base_ms = backoff_base_ms(attempt);
        let jitter = rand::thread_rng().gen_range(0..=250);
        sleep(Duration::from_millis(base_ms + jitter)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn auth_request_signs_the_expiry() {
        let req = auth_request("key-1", "secret-1", 1_000);
        let expected_sig = sign_payload("secret-1", "GET/realtime11000");
        // serde_json orders object keys alphabetically
        assert_eq!(
            req,
            format!(r#"{{"args":["key-1",11000,"{}"],"op":"auth"}}"#, expected_sig)
        );
    }

    #[test]
    fn subscribe_targets_the_order_topic() {
        assert_eq!(subscribe_request(), r#"{"args":["order"],"op":"subscribe"}"#);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_base_ms(1), 1_000);
        assert_eq!(backoff_base_ms(2), 2_000);
        assert_eq!(backoff_base_ms(6), 32_000);
        assert_eq!(backoff_base_ms(7), 32_000);
        assert_eq!(backoff_base_ms(u32::MAX), 32_000);
    }

    #[test]
    fn parses_an_order_row() {
        let row = serde_json::json!({
            "orderId": "1234-5678",
            "orderLinkId": "",
            "symbol": "BTCUSDT",
            "side": "Sell",
            "orderType": "Limit",
            "price": "43860",
            "qty": "0.5",
            "orderStatus": "Filled",
            "avgPrice": "43861.5",
            "cumExecQty": "0.5",
            "reduceOnly": true
        });
        let upd = parse_order_row(&row).unwrap();
        assert_eq!(upd.order_id, "1234-5678");
        assert_eq!(upd.symbol, "BTCUSDT");
        assert_eq!(upd.status, OrderStatus::Filled);
        assert_eq!(upd.avg_price, Some(dec!(43861.5)));
        assert_eq!(upd.cum_exec_qty, Some(dec!(0.5)));
    }

    #[test]
    fn order_row_without_id_is_dropped() {
        let row = serde_json::json!({"symbol": "BTCUSDT", "orderStatus": "New"});
        assert!(parse_order_row(&row).is_none());
    }

    #[test]
    fn unfilled_row_has_no_exec_fields() {
        let row = serde_json::json!({
            "orderId": "abc",
            "symbol": "ETHUSDT",
            "orderStatus": "New",
            "avgPrice": "",
            "cumExecQty": "0"
        });
        let upd = parse_order_row(&row).unwrap();
        assert_eq!(upd.status, OrderStatus::New);
        assert_eq!(upd.avg_price, None);
        assert_eq!(upd.cum_exec_qty, None);
    }
}
