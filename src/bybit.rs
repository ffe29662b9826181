// ===============================
// src/bybit.rs
// ===============================
//
// Bybit v5 REST client (category "linear"). Requests are signed with
// HMAC-SHA256 over `{timestamp}{api_key}{recv_window}{payload}` where the
// payload is the exact query string (GET) or JSON body (POST) that goes on
// the wire. Every response arrives in the { retCode, retMsg, result }
// envelope; retCode != 0 becomes ApiError::Exchange.

use ahash::AHashMap;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

use crate::domain::{parse_dec, parse_opt_dec, InstrumentRule, Position, Side, WalletSnapshot};
use crate::metrics::API_REQUESTS;

// retCode values the guard reacts to.
pub const RET_OK: i64 = 0;
/// Parameter error; on trading-stop/order endpoints this is what a wrong
/// positionIdx comes back as.
pub const RET_PARAM_ERROR: i64 = 10001;
/// Request timestamp outside recv_window: local clock is off the server's.
pub const RET_INVALID_TIMESTAMP: i64 = 10002;
/// Trading stop already at the requested value.
pub const RET_NOT_MODIFIED: i64 = 34040;
pub const RET_ORDER_NOT_FOUND: i64 = 110001;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("decode response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("bybit retCode {code}: {message}")]
    Exchange { code: i64, message: String },
    #[error("response carried no usable result")]
    EmptyResult,
}

impl ApiError {
    pub fn exchange_code(&self) -> Option<i64> {
        match self {
            ApiError::Exchange { code, .. } => Some(*code),
            _ => None,
        }
    }
    pub fn is_position_idx_mismatch(&self) -> bool {
        self.exchange_code() == Some(RET_PARAM_ERROR)
    }
    pub fn is_clock_skew(&self) -> bool {
        self.exchange_code() == Some(RET_INVALID_TIMESTAMP)
    }
    pub fn is_not_modified(&self) -> bool {
        self.exchange_code() == Some(RET_NOT_MODIFIED)
    }
    pub fn is_order_not_found(&self) -> bool {
        self.exchange_code() == Some(RET_ORDER_NOT_FOUND)
    }
}

pub fn timestamp_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn sign_payload(secret: &str, payload: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC key");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

// ---- Wire models ----

#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(rename = "retCode")]
    pub ret_code: i64,
    #[serde(rename = "retMsg", default)]
    pub ret_msg: String,
    #[serde(default)]
    pub result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct ListResult<T> {
    #[serde(default = "Vec::new")]
    pub list: Vec<T>,
}

#[derive(Debug, Deserialize)]
pub struct WalletAccount {
    #[serde(rename = "accountType", default)]
    pub account_type: String,
    #[serde(rename = "totalEquity", default)]
    pub total_equity: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct PriceFilter {
    #[serde(rename = "tickSize", default)]
    pub tick_size: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct LotSizeFilter {
    #[serde(rename = "minOrderQty", default)]
    pub min_order_qty: String,
    #[serde(rename = "qtyStep", default)]
    pub qty_step: String,
}

#[derive(Debug, Deserialize)]
pub struct InstrumentInfo {
    #[serde(default)]
    pub symbol: String,
    #[serde(rename = "priceFilter", default)]
    pub price_filter: PriceFilter,
    #[serde(rename = "lotSizeFilter", default)]
    pub lot_size_filter: LotSizeFilter,
}

#[derive(Debug, Deserialize)]
pub struct RawPosition {
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub size: String,
    #[serde(rename = "avgPrice", default)]
    pub avg_price: String,
    #[serde(rename = "markPrice", default)]
    pub mark_price: String,
    #[serde(rename = "positionValue", default)]
    pub position_value: String,
    #[serde(rename = "unrealisedPnl", default)]
    pub unrealised_pnl: String,
    #[serde(default)]
    pub leverage: String,
    #[serde(rename = "positionIdx", default)]
    pub position_idx: u8,
    #[serde(rename = "stopLoss", default)]
    pub stop_loss: String,
    #[serde(rename = "takeProfit", default)]
    pub take_profit: String,
    #[serde(rename = "liqPrice", default)]
    pub liq_price: String,
    #[serde(rename = "updatedTime", default)]
    pub updated_time: String,
}

impl RawPosition {
    pub fn into_position(self) -> Position {
        Position {
            side: Side::parse(&self.side),
            size: parse_dec(&self.size),
            entry_price: parse_dec(&self.avg_price),
            mark_price: parse_dec(&self.mark_price),
            position_value: parse_dec(&self.position_value),
            unrealised_pnl: parse_dec(&self.unrealised_pnl),
            leverage: self.leverage,
            position_idx: self.position_idx,
            stop_loss: parse_opt_dec(&self.stop_loss),
            take_profit: parse_opt_dec(&self.take_profit),
            liq_price: parse_opt_dec(&self.liq_price),
            updated_time: self.updated_time,
            symbol: self.symbol,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OrderCreated {
    #[serde(rename = "orderId", default)]
    order_id: String,
}

/// Unpack an envelope into the typed result, tracking the outcome per
/// endpoint.
fn unpack<T: DeserializeOwned>(env: Envelope, endpoint: &str) -> Result<T, ApiError> {
    if env.ret_code != RET_OK {
        API_REQUESTS.with_label_values(&[endpoint, "exchange_err"]).inc();
        return Err(ApiError::Exchange { code: env.ret_code, message: env.ret_msg });
    }
    match serde_json::from_value(env.result) {
        Ok(v) => {
            API_REQUESTS.with_label_values(&[endpoint, "ok"]).inc();
            Ok(v)
        }
        Err(e) => {
            API_REQUESTS.with_label_values(&[endpoint, "decode_err"]).inc();
            Err(e.into())
        }
    }
}

// ---- Client ----

pub struct BybitClient {
    http: reqwest::Client,
    rest_base: String,
    api_key: String,
    api_secret: String,
    recv_window_ms: u64,
    rules: Mutex<AHashMap<String, InstrumentRule>>,
}

impl BybitClient {
    pub fn new(rest_base: String, api_key: String, api_secret: String, recv_window_ms: u64) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            rest_base: rest_base.trim_end_matches('/').to_string(),
            api_key,
            api_secret,
            recv_window_ms,
            rules: Mutex::new(AHashMap::new()),
        })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
        endpoint: &str,
    ) -> Result<T, ApiError> {
        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let ts = timestamp_ms();
        let payload = format!("{}{}{}{}", ts, self.api_key, self.recv_window_ms, query);
        let sig = sign_payload(&self.api_secret, &payload);

        let url = format!("{}{}?{}", self.rest_base, path, query);
        let resp = match self
            .http
            .get(url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", ts.to_string())
            .header("X-BAPI-RECV-WINDOW", self.recv_window_ms.to_string())
            .header("X-BAPI-SIGN", sig)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                API_REQUESTS.with_label_values(&[endpoint, "transport_err"]).inc();
                return Err(e.into());
            }
        };
        self.read_envelope(resp, endpoint).await
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
        endpoint: &str,
    ) -> Result<T, ApiError> {
        // The signed payload must be byte-identical to the request body.
        let body_text = body.to_string();
        let ts = timestamp_ms();
        let payload = format!("{}{}{}{}", ts, self.api_key, self.recv_window_ms, body_text);
        let sig = sign_payload(&self.api_secret, &payload);

        let resp = match self
            .http
            .post(format!("{}{}", self.rest_base, path))
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", ts.to_string())
            .header("X-BAPI-RECV-WINDOW", self.recv_window_ms.to_string())
            .header("X-BAPI-SIGN", sig)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body_text)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                API_REQUESTS.with_label_values(&[endpoint, "transport_err"]).inc();
                return Err(e.into());
            }
        };
        self.read_envelope(resp, endpoint).await
    }

    async fn read_envelope<T: DeserializeOwned>(
        &self,
        resp: reqwest::Response,
        endpoint: &str,
    ) -> Result<T, ApiError> {
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            API_REQUESTS.with_label_values(&[endpoint, "http_err"]).inc();
            return Err(ApiError::Status { status: status.as_u16(), body: text });
        }
        let env: Envelope = match serde_json::from_str(&text) {
            Ok(e) => e,
            Err(e) => {
                API_REQUESTS.with_label_values(&[endpoint, "decode_err"]).inc();
                return Err(e.into());
            }
        };
        unpack(env, endpoint)
    }

    // ----- endpoints -----

    /// Connection test: unified account wallet balance.
    pub async fn wallet_balance(&self) -> Result<WalletSnapshot, ApiError> {
        let params = [("accountType", "UNIFIED".to_string())];
        let res: ListResult<WalletAccount> =
            self.get("/v5/account/wallet-balance", &params, "wallet_balance").await?;
        let acct = res.list.into_iter().next().ok_or(ApiError::EmptyResult)?;
        Ok(WalletSnapshot {
            account_type: acct.account_type,
            total_equity: parse_dec(&acct.total_equity),
        })
    }

    /// Tick/lot rules for a symbol, cached after the first fetch.
    pub async fn instrument_rule(&self, symbol: &str) -> Result<InstrumentRule, ApiError> {
        if let Ok(cache) = self.rules.lock() {
            if let Some(rule) = cache.get(symbol) {
                return Ok(rule.clone());
            }
        }
        let params = [
            ("category", "linear".to_string()),
            ("symbol", symbol.to_string()),
        ];
        let res: ListResult<InstrumentInfo> =
            self.get("/v5/market/instruments-info", &params, "instruments_info").await?;
        let info = res.list.into_iter().next().ok_or(ApiError::EmptyResult)?;
        let rule = InstrumentRule::new(
            symbol,
            parse_dec(&info.price_filter.tick_size),
            parse_dec(&info.lot_size_filter.qty_step),
            parse_dec(&info.lot_size_filter.min_order_qty),
        );
        if let Ok(mut cache) = self.rules.lock() {
            cache.insert(symbol.to_string(), rule.clone());
        }
        Ok(rule)
    }

    pub async fn positions_for_symbol(&self, symbol: &str) -> Result<Vec<Position>, ApiError> {
        let params = [
            ("category", "linear".to_string()),
            ("symbol", symbol.to_string()),
        ];
        self.position_list(&params).await
    }

    pub async fn positions_by_settle_coin(&self, settle_coin: &str) -> Result<Vec<Position>, ApiError> {
        let params = [
            ("category", "linear".to_string()),
            ("settleCoin", settle_coin.to_string()),
        ];
        self.position_list(&params).await
    }

    async fn position_list(&self, params: &[(&str, String)]) -> Result<Vec<Position>, ApiError> {
        let res: ListResult<RawPosition> = self.get("/v5/position/list", params, "position_list").await?;
        Ok(res.list.into_iter().map(RawPosition::into_position).collect())
    }

    /// Apply a position stop loss, triggered on last price.
    pub async fn set_trading_stop(
        &self,
        symbol: &str,
        stop_loss: Decimal,
        position_idx: u8,
    ) -> Result<(), ApiError> {
        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "stopLoss": stop_loss.to_string(),
            "slTriggerBy": "LastPrice",
            "positionIdx": position_idx,
        });
        let _: serde_json::Value = self.post("/v5/position/trading-stop", &body, "trading_stop").await?;
        Ok(())
    }

    /// Place the reduce-only limit order used as a take profit. Returns the
    /// exchange order id.
    pub async fn place_reduce_only_limit(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
        price: Decimal,
        position_idx: u8,
    ) -> Result<String, ApiError> {
        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "side": side.as_str(),
            "orderType": "Limit",
            "qty": qty.to_string(),
            "price": price.to_string(),
            "timeInForce": "GTC",
            "reduceOnly": true,
            "positionIdx": position_idx,
        });
        let created: OrderCreated = self.post("/v5/order/create", &body, "order_create").await?;
        if created.order_id.is_empty() {
            return Err(ApiError::EmptyResult);
        }
        Ok(created.order_id)
    }

    pub async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ApiError> {
        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "orderId": order_id,
        });
        let _: serde_json::Value = self.post("/v5/order/cancel", &body, "order_cancel").await?;
        Ok(())
    }

    /// Cancel every open order on the symbol; returns how many went away.
    pub async fn cancel_all_orders(&self, symbol: &str) -> Result<usize, ApiError> {
        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
        });
        let res: ListResult<serde_json::Value> =
            self.post("/v5/order/cancel-all", &body, "order_cancel_all").await?;
        Ok(res.list.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn make_envelope(code: i64, msg: &str, result: serde_json::Value) -> Envelope {
        Envelope { ret_code: code, ret_msg: msg.to_string(), result }
    }

    #[test]
    fn sign_payload_matches_rfc4231_vector() {
        // RFC 4231 test case 2
        let sig = sign_payload("Jefe", "what do ya want for nothing?");
        assert_eq!(
            sig,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn unpack_maps_ret_codes_to_errors() {
        let err = unpack::<serde_json::Value>(
            make_envelope(10001, "position idx not match position mode", serde_json::Value::Null),
            "trading_stop",
        )
        .unwrap_err();
        assert!(err.is_position_idx_mismatch());
        assert!(!err.is_not_modified());

        let err = unpack::<serde_json::Value>(
            make_envelope(34040, "not modified", serde_json::Value::Null),
            "trading_stop",
        )
        .unwrap_err();
        assert!(err.is_not_modified());

        let err = unpack::<serde_json::Value>(
            make_envelope(10002, "invalid request timestamp", serde_json::Value::Null),
            "wallet_balance",
        )
        .unwrap_err();
        assert!(err.is_clock_skew());
    }

    #[test]
    fn unpack_passes_result_through_on_ok() {
        let v: ListResult<WalletAccount> = unpack(
            make_envelope(
                0,
                "OK",
                serde_json::json!({"list": [{"accountType": "UNIFIED", "totalEquity": "123.45"}]}),
            ),
            "wallet_balance",
        )
        .unwrap();
        assert_eq!(v.list.len(), 1);
        assert_eq!(v.list[0].total_equity, "123.45");
    }

    #[test]
    fn envelope_parses_real_shape() {
        let env: Envelope = serde_json::from_str(
            r#"{"retCode":0,"retMsg":"OK","result":{"list":[]},"retExtInfo":{},"time":1700000000000}"#,
        )
        .unwrap();
        assert_eq!(env.ret_code, 0);
        assert_eq!(env.ret_msg, "OK");
    }

    #[test]
    fn raw_position_parses_v5_row() {
        let raw: RawPosition = serde_json::from_str(
            r#"{
                "symbol": "BTCUSDT",
                "side": "Buy",
                "size": "0.5",
                "avgPrice": "43210.50",
                "markPrice": "43514.20",
                "positionValue": "21605.25",
                "unrealisedPnl": "151.85",
                "leverage": "10",
                "positionIdx": 0,
                "stopLoss": "",
                "takeProfit": "44110",
                "liqPrice": "",
                "tradeMode": 0,
                "updatedTime": "1700000000000"
            }"#,
        )
        .unwrap();
        let pos = raw.into_position();
        assert_eq!(pos.symbol, "BTCUSDT");
        assert_eq!(pos.side, Some(Side::Buy));
        assert_eq!(pos.size, dec!(0.5));
        assert_eq!(pos.entry_price, dec!(43210.50));
        assert_eq!(pos.stop_loss, None);
        assert_eq!(pos.take_profit, Some(dec!(44110)));
        assert_eq!(pos.liq_price, None);
        assert_eq!(pos.updated_time, "1700000000000");
        assert!(pos.is_open());
    }

    #[test]
    fn flat_position_row_parses_to_closed() {
        let raw: RawPosition = serde_json::from_str(
            r#"{"symbol":"ETHUSDT","side":"None","size":"0","avgPrice":"0","markPrice":"2301.1",
                "positionValue":"0","unrealisedPnl":"0","leverage":"","positionIdx":0,
                "stopLoss":"","takeProfit":"","liqPrice":""}"#,
        )
        .unwrap();
        let pos = raw.into_position();
        assert_eq!(pos.side, None);
        assert!(!pos.is_open());
    }

    #[test]
    fn instrument_info_parses_filters() {
        let info: InstrumentInfo = serde_json::from_str(
            r#"{
                "symbol": "BTCUSDT",
                "priceFilter": {"minPrice": "0.10", "maxPrice": "1999999.80", "tickSize": "0.10"},
                "lotSizeFilter": {"maxOrderQty": "1190", "minOrderQty": "0.001", "qtyStep": "0.001"}
            }"#,
        )
        .unwrap();
        assert_eq!(info.price_filter.tick_size, "0.10");
        assert_eq!(info.lot_size_filter.min_order_qty, "0.001");
        let rule = InstrumentRule::new(
            &info.symbol,
            parse_dec(&info.price_filter.tick_size),
            parse_dec(&info.lot_size_filter.qty_step),
            parse_dec(&info.lot_size_filter.min_order_qty),
        );
        assert_eq!(rule.round_price_down(dec!(43210.57)), dec!(43210.5));
    }

    #[test]
    fn list_result_defaults_when_list_missing() {
        let res: ListResult<RawPosition> = serde_json::from_str("{}").unwrap();
        assert!(res.list.is_empty());
    }
}
