// ===============================
// src/monitor.rs
// ===============================
//
// Read-only account view: wallet equity plus every open linear position,
// fetched per settle coin and rendered as a plain-text table. The guard
// itself never calls this; it backs `positions` on the CLI and the startup
// symbol pick.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::warn;

use crate::bybit::{ApiError, BybitClient};
use crate::domain::{Position, PositionsSummary, WalletSnapshot};
use crate::metrics::{POSITION_PNL_BP, POSITION_VALUE_USDT};

const SETTLE_COINS: [&str; 2] = ["USDT", "USDC"];

pub struct AccountOverview {
    pub wallet: Option<WalletSnapshot>,
    pub summary: PositionsSummary,
}

/// Wallet equity plus open positions across settle coins. A missing wallet
/// row degrades to None; position fetches may partially fail as long as at
/// least one settle coin answers.
pub async fn account_overview(client: &BybitClient) -> Result<AccountOverview, ApiError> {
    let wallet = match client.wallet_balance().await {
        Ok(w) => Some(w),
        Err(e) => {
            warn!(error = %e, "wallet balance unavailable");
            None
        }
    };

    let mut all: Vec<Position> = Vec::new();
    let mut last_err: Option<ApiError> = None;
    let mut fetched = 0usize;
    for coin in SETTLE_COINS {
        match client.positions_by_settle_coin(coin).await {
            Ok(mut positions) => {
                fetched += 1;
                all.append(&mut positions);
            }
            Err(e) => {
                warn!(settle_coin = coin, error = %e, "position fetch failed");
                last_err = Some(e);
            }
        }
    }
    if fetched == 0 {
        if let Some(e) = last_err {
            return Err(e);
        }
    }

    Ok(AccountOverview { wallet, summary: PositionsSummary::from_positions(all) })
}

/// When exactly one symbol has an open position, that is the one to guard.
pub fn auto_select_symbol(summary: &PositionsSummary) -> Option<String> {
    let mut it = summary.positions.iter().map(|p| p.symbol.as_str());
    let first = it.next()?;
    if it.all(|s| s == first) {
        Some(first.to_string())
    } else {
        None
    }
}

fn fmt_dec(d: Decimal) -> String {
    d.normalize().to_string()
}

fn fmt_opt(d: Option<Decimal>) -> String {
    match d {
        Some(v) => fmt_dec(v),
        None => "-".to_string(),
    }
}

fn fmt_signed(d: Decimal) -> String {
    if d.is_sign_positive() && !d.is_zero() {
        format!("+{}", fmt_dec(d))
    } else {
        fmt_dec(d)
    }
}

/// Render the overview as a fixed-width table. Pure string building so the
/// layout is testable.
pub fn render_summary(view: &AccountOverview) -> String {
    let mut out = String::new();
    if let Some(w) = &view.wallet {
        out.push_str(&format!(
            "account {:<8} equity {} USD\n\n",
            w.account_type,
            fmt_dec(w.total_equity)
        ));
    }

    let s = &view.summary;
    if s.positions.is_empty() {
        out.push_str("no open positions\n");
        return out;
    }

    out.push_str(&format!(
        "{:<12} {:<5} {:>12} {:>14} {:>14} {:>14} {:>12} {:>8} {:>12} {:>12}\n",
        "SYMBOL", "SIDE", "SIZE", "ENTRY", "MARK", "VALUE", "PNL", "PNL%", "SL", "TP"
    ));
    for p in &s.positions {
        let side = p.side.map(|v| v.as_str()).unwrap_or("?");
        let pnl_pct = p
            .side
            .and_then(|v| crate::domain::pnl_percent(v, p.entry_price, p.mark_price))
            .map(|v| format!("{:.2}", v))
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "{:<12} {:<5} {:>12} {:>14} {:>14} {:>14} {:>12} {:>8} {:>12} {:>12}\n",
            p.symbol,
            side,
            fmt_dec(p.size),
            fmt_dec(p.entry_price),
            fmt_dec(p.mark_price),
            fmt_dec(p.position_value),
            fmt_signed(p.unrealised_pnl),
            pnl_pct,
            fmt_opt(p.stop_loss),
            fmt_opt(p.take_profit),
        ));
    }
    out.push_str(&format!(
        "\n{} position(s)  value {}  uPnL {}\n",
        s.total_positions,
        fmt_dec(s.total_position_value),
        fmt_signed(s.total_unrealised_pnl),
    ));
    out
}

/// Push the position snapshot into the gauges (whole USDT / basis points).
pub fn update_position_metrics(summary: &PositionsSummary) {
    for p in &summary.positions {
        if let Some(v) = p.position_value.round().to_i64() {
            POSITION_VALUE_USDT.with_label_values(&[&p.symbol]).set(v);
        }
        if let Some(side) = p.side {
            if let Some(pct) = crate::domain::pnl_percent(side, p.entry_price, p.mark_price) {
                if let Some(bp) = (pct * Decimal::ONE_HUNDRED).round().to_i64() {
                    POSITION_PNL_BP.with_label_values(&[&p.symbol]).set(bp);
                }
            }
        }
    }
}

/// `positions --watch`: redraw the table every `interval_secs` until Ctrl-C.
pub async fn watch(client: Arc<BybitClient>, interval_secs: u64) -> Result<(), ApiError> {
    let mut tick = interval(Duration::from_secs(interval_secs.max(1)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                match account_overview(&client).await {
                    Ok(view) => {
                        update_position_metrics(&view.summary);
                        println!("{}", render_summary(&view));
                    }
                    Err(e) => warn!(error = %e, "account overview failed, retrying"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                return Ok(());
            }
        }
    }
}
