// ===============================
// src/domain.rs
// ===============================
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side { Buy, Sell }

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self { Side::Buy => "Buy", Side::Sell => "Sell" }
    }
    pub fn opposite(&self) -> Side {
        match self { Side::Buy => Side::Sell, Side::Sell => Side::Buy }
    }
    /// Bybit sends "Buy"/"Sell", or "None"/"" on flat rows.
    pub fn parse(s: &str) -> Option<Side> {
        match s { "Buy" => Some(Side::Buy), "Sell" => Some(Side::Sell), _ => None }
    }
}

/// Parse a Bybit decimal string; empty or malformed fields count as zero.
pub fn parse_dec(s: &str) -> Decimal {
    s.trim().parse().unwrap_or_default()
}

/// Like `parse_dec`, but "" / "0" mean "not set" (Bybit uses both for
/// unset stopLoss/takeProfit/liqPrice fields).
pub fn parse_opt_dec(s: &str) -> Option<Decimal> {
    let d = parse_dec(s);
    if d.is_zero() { None } else { Some(d) }
}

/// One row of `/v5/position/list`, already parsed out of the wire strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Option<Side>,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub position_value: Decimal,
    pub unrealised_pnl: Decimal,
    pub leverage: String,
    pub position_idx: u8,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub liq_price: Option<Decimal>,
    pub updated_time: String,
}

impl Position {
    /// The exchange keeps returning settled rows; a position counts as open
    /// while any of size / value / uPnL is non-zero.
    pub fn is_open(&self) -> bool {
        !self.size.is_zero() || !self.position_value.is_zero() || !self.unrealised_pnl.is_zero()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionsSummary {
    pub total_positions: usize,
    pub total_unrealised_pnl: Decimal,
    pub total_position_value: Decimal,
    pub positions: Vec<Position>,
}

impl PositionsSummary {
    pub fn from_positions(all: Vec<Position>) -> Self {
        let positions: Vec<Position> = all.into_iter().filter(Position::is_open).collect();
        let total_unrealised_pnl = positions.iter().map(|p| p.unrealised_pnl).sum();
        let total_position_value = positions.iter().map(|p| p.position_value).sum();
        Self { total_positions: positions.len(), total_unrealised_pnl, total_position_value, positions }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WalletSnapshot { pub account_type: String, pub total_equity: Decimal }

/// Exchange rounding defaults to this when lotSizeFilter carries no
/// usable minOrderQty.
pub const FALLBACK_MIN_ORDER_QTY: &str = "0.001";

/// Per-symbol trading rules from `/v5/market/instruments-info`.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentRule {
    pub symbol: String,
    pub tick_size: Decimal,
    pub qty_step: Decimal,
    pub min_order_qty: Decimal,
}

impl InstrumentRule {
    pub fn new(symbol: &str, tick_size: Decimal, qty_step: Decimal, min_order_qty: Decimal) -> Self {
        let min_order_qty = if min_order_qty <= Decimal::ZERO {
            parse_dec(FALLBACK_MIN_ORDER_QTY)
        } else {
            min_order_qty
        };
        Self { symbol: symbol.to_string(), tick_size, qty_step, min_order_qty }
    }

    /// Floor a price to the instrument tick grid.
    pub fn round_price_down(&self, px: Decimal) -> Decimal {
        if self.tick_size <= Decimal::ZERO {
            return px;
        }
        ((px / self.tick_size).floor() * self.tick_size).normalize()
    }

    /// Floor a quantity to the lot step, then raise to the exchange minimum.
    pub fn clamp_qty(&self, qty: Decimal) -> Decimal {
        let stepped = if self.qty_step > Decimal::ZERO {
            (qty / self.qty_step).floor() * self.qty_step
        } else {
            qty
        };
        if stepped < self.min_order_qty { self.min_order_qty.normalize() } else { stepped.normalize() }
    }
}

/// Live strategy knobs for the guard loop. Equality drives change
/// detection on the settings watch channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardSettings {
    pub sl_enabled: bool,
    pub sl_amount: Decimal,
    pub tp_enabled: bool,
    pub tp_percent: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus { New, PartiallyFilled, Filled, Cancelled, Rejected, Other }

impl OrderStatus {
    pub fn parse(s: &str) -> OrderStatus {
        match s {
            "New" | "Untriggered" | "Triggered" => OrderStatus::New,
            "PartiallyFilled" => OrderStatus::PartiallyFilled,
            "Filled" => OrderStatus::Filled,
            "Cancelled" | "PartiallyFilledCanceled" | "Deactivated" => OrderStatus::Cancelled,
            "Rejected" => OrderStatus::Rejected,
            _ => OrderStatus::Other,
        }
    }
}

/// One row of the private `order` stream topic.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub order_id: String,
    pub order_link_id: String,
    pub symbol: String,
    pub status: OrderStatus,
    pub avg_price: Option<Decimal>,
    pub cum_exec_qty: Option<Decimal>,
}

/// Everything the guard does ends up here, for logs and the JSONL recorder.
#[derive(Debug, Clone, Serialize)]
pub enum GuardEvent {
    Started { symbol: String, sl_enabled: bool, tp_enabled: bool },
    StopLossSet { symbol: String, price: Decimal, position_idx: u8 },
    TakeProfitPlaced { symbol: String, order_id: String, price: Decimal, qty: Decimal },
    TakeProfitFilled { symbol: String, order_id: String },
    TakeProfitCancelled { symbol: String, order_id: String, reason: String },
    OrdersCancelled { symbol: String, count: usize },
    PositionFlat { symbol: String },
    SettingsChanged { sl_enabled: bool, sl_amount: Decimal, tp_enabled: bool, tp_percent: Decimal },
    ApiRejected { stage: String, message: String },
}

/// Stop price for a fixed loss budget in settlement currency.
///
/// loss fraction = sl_amount / position_value, price distance =
/// entry * fraction, applied against the position direction. None when the
/// inputs cannot produce a positive trigger price.
pub fn sl_price(side: Side, entry: Decimal, position_value: Decimal, sl_amount: Decimal) -> Option<Decimal> {
    if entry <= Decimal::ZERO || position_value <= Decimal::ZERO || sl_amount <= Decimal::ZERO {
        return None;
    }
    let change = entry * (sl_amount / position_value);
    let px = match side {
        Side::Buy => entry - change,
        Side::Sell => entry + change,
    };
    if px <= Decimal::ZERO { None } else { Some(px) }
}

/// Target price for a percent-over-entry take profit.
pub fn tp_price(side: Side, entry: Decimal, tp_percent: Decimal) -> Option<Decimal> {
    if entry <= Decimal::ZERO || tp_percent <= Decimal::ZERO {
        return None;
    }
    let change = entry * tp_percent / Decimal::ONE_HUNDRED;
    let px = match side {
        Side::Buy => entry + change,
        Side::Sell => entry - change,
    };
    if px <= Decimal::ZERO { None } else { Some(px) }
}

/// Signed PnL percent relative to entry, as shown in the positions table.
pub fn pnl_percent(side: Side, entry: Decimal, mark: Decimal) -> Option<Decimal> {
    if entry.is_zero() || mark.is_zero() {
        return None;
    }
    let raw = (mark - entry) / entry * Decimal::ONE_HUNDRED;
    Some(match side { Side::Buy => raw, Side::Sell => -raw })
}

/// Uppercase the ticker and append the USDT quote when the user typed a
/// bare coin name. USDC contracts pass through untouched.
pub fn normalize_symbol(input: &str) -> String {
    let mut sym = input.trim().to_ascii_uppercase();
    if !sym.is_empty() && !sym.ends_with("USDT") && !sym.ends_with("USDC") {
        sym.push_str("USDT");
    }
    sym
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn make_rule() -> InstrumentRule {
        InstrumentRule::new("BTCUSDT", dec!(0.5), dec!(0.001), dec!(0.001))
    }

    fn make_position(side: Side, size: Decimal, entry: Decimal) -> Position {
        Position {
            symbol: "BTCUSDT".into(),
            side: Some(side),
            size,
            entry_price: entry,
            mark_price: entry,
            position_value: size * entry,
            unrealised_pnl: Decimal::ZERO,
            leverage: "10".into(),
            position_idx: 0,
            stop_loss: None,
            take_profit: None,
            liq_price: None,
            updated_time: String::new(),
        }
    }

    #[test]
    fn sl_price_long_moves_below_entry() {
        // value 1000, budget 10 -> 1% below entry
        let px = sl_price(Side::Buy, dec!(100), dec!(1000), dec!(10));
        assert_eq!(px, Some(dec!(99)));
    }

    #[test]
    fn sl_price_short_moves_above_entry() {
        let px = sl_price(Side::Sell, dec!(100), dec!(1000), dec!(10));
        assert_eq!(px, Some(dec!(101)));
    }

    #[test]
    fn sl_price_rejects_unreachable_budget() {
        // losing 200 USDT on a 100 USDT position puts the stop below zero
        assert_eq!(sl_price(Side::Buy, dec!(100), dec!(100), dec!(200)), None);
    }

    #[test]
    fn sl_price_rejects_empty_inputs() {
        assert_eq!(sl_price(Side::Buy, dec!(0), dec!(1000), dec!(10)), None);
        assert_eq!(sl_price(Side::Buy, dec!(100), dec!(0), dec!(10)), None);
        assert_eq!(sl_price(Side::Buy, dec!(100), dec!(1000), dec!(0)), None);
    }

    #[test]
    fn tp_price_by_side() {
        assert_eq!(tp_price(Side::Buy, dec!(100), dec!(2)), Some(dec!(102)));
        assert_eq!(tp_price(Side::Sell, dec!(100), dec!(2)), Some(dec!(98)));
        assert_eq!(tp_price(Side::Buy, dec!(100), dec!(0)), None);
    }

    #[test]
    fn tp_price_rejects_negative_result() {
        assert_eq!(tp_price(Side::Sell, dec!(100), dec!(150)), None);
    }

    #[test]
    fn pnl_percent_is_signed_by_side() {
        assert_eq!(pnl_percent(Side::Buy, dec!(100), dec!(110)), Some(dec!(10)));
        assert_eq!(pnl_percent(Side::Sell, dec!(100), dec!(110)), Some(dec!(-10)));
        assert_eq!(pnl_percent(Side::Buy, dec!(0), dec!(110)), None);
    }

    #[test]
    fn round_price_down_floors_to_tick() {
        let rule = make_rule();
        assert_eq!(rule.round_price_down(dec!(27123.47)), dec!(27123));
        assert_eq!(rule.round_price_down(dec!(27123.5)), dec!(27123.5));
        let fine = InstrumentRule::new("XRPUSDT", dec!(0.0001), dec!(1), dec!(1));
        assert_eq!(fine.round_price_down(dec!(0.56789)), dec!(0.5678));
    }

    #[test]
    fn round_price_down_without_tick_is_identity() {
        let rule = InstrumentRule::new("X", dec!(0), dec!(0.001), dec!(0.001));
        assert_eq!(rule.round_price_down(dec!(1.2345)), dec!(1.2345));
    }

    #[test]
    fn clamp_qty_floors_to_step_and_respects_minimum() {
        let rule = make_rule();
        assert_eq!(rule.clamp_qty(dec!(1.2345)), dec!(1.234));
        assert_eq!(rule.clamp_qty(dec!(0.0004)), dec!(0.001));
        assert_eq!(rule.clamp_qty(dec!(5)), dec!(5));
    }

    #[test]
    fn min_order_qty_falls_back_when_missing() {
        let rule = InstrumentRule::new("BTCUSDT", dec!(0.5), dec!(0.001), dec!(0));
        assert_eq!(rule.min_order_qty, dec!(0.001));
    }

    #[test]
    fn normalize_symbol_appends_quote() {
        assert_eq!(normalize_symbol("btc"), "BTCUSDT");
        assert_eq!(normalize_symbol(" eth "), "ETHUSDT");
        assert_eq!(normalize_symbol("BTCUSDT"), "BTCUSDT");
        assert_eq!(normalize_symbol("solusdc"), "SOLUSDC");
        assert_eq!(normalize_symbol(""), "");
    }

    #[test]
    fn side_parse_and_opposite() {
        assert_eq!(Side::parse("Buy"), Some(Side::Buy));
        assert_eq!(Side::parse("None"), None);
        assert_eq!(Side::Buy.opposite(), Side::Sell);
    }

    #[test]
    fn order_status_parse_covers_terminal_states() {
        assert_eq!(OrderStatus::parse("Filled"), OrderStatus::Filled);
        assert_eq!(OrderStatus::parse("PartiallyFilledCanceled"), OrderStatus::Cancelled);
        assert_eq!(OrderStatus::parse("SomethingNew"), OrderStatus::Other);
    }

    #[test]
    fn summary_keeps_open_rows_and_totals() {
        let mut closed = make_position(Side::Buy, dec!(0), dec!(100));
        closed.position_value = dec!(0);
        let mut long = make_position(Side::Buy, dec!(1), dec!(100));
        long.unrealised_pnl = dec!(5);
        let mut short = make_position(Side::Sell, dec!(2), dec!(50));
        short.unrealised_pnl = dec!(-2);

        let s = PositionsSummary::from_positions(vec![closed, long, short]);
        assert_eq!(s.total_positions, 2);
        assert_eq!(s.total_unrealised_pnl, dec!(3));
        assert_eq!(s.total_position_value, dec!(200));
    }

    #[test]
    fn parse_opt_dec_treats_zero_as_unset() {
        assert_eq!(parse_opt_dec(""), None);
        assert_eq!(parse_opt_dec("0"), None);
        assert_eq!(parse_opt_dec("42.5"), Some(dec!(42.5)));
    }
}
