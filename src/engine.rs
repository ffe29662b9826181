// ===============================
// src/engine.rs
// ===============================
//
// The guard loop. Once a second it reloads the position, recomputes the
// stop loss (fixed currency loss) and take profit (percent over entry),
// and pushes only what changed to the exchange:
// - Stop loss goes on the position itself (trading-stop, LastPrice trigger).
// - Take profit is a reduce-only GTC limit order, cancel-then-replace.
// - A flat position sweeps with cancel-all while a take profit order is
//   tracked, then tracking resets. A stop loss leaves nothing to cancel;
//   it rides on the position and dies with it.
//
// Planning is split from committing so the decision logic stays testable:
// plan_* looks at a position and returns a decision, the loop performs the
// API calls and marks the state only after they succeed.

use rust_decimal::Decimal;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::bybit::{ApiError, BybitClient};
use crate::domain::{
    sl_price, tp_price, GuardEvent, GuardSettings, InstrumentRule, OrderStatus, OrderUpdate,
    Position, PositionsSummary,
};
use crate::metrics::{
    CLOCK_SKEW_WARNINGS, CONFIG_STRATEGY_ACTIVE, GUARD_CYCLES, GUARD_CYCLE_ERRORS,
    ORDERS_CANCELLED, POSITION_PNL_BP, POSITION_VALUE_USDT, SL_UPDATES, TP_FILLS,
    TP_REPLACEMENTS, UNATTAINABLE_TARGETS,
};
use crate::monitor;

#[derive(Debug, Clone, PartialEq)]
pub enum SlDecision {
    /// Nothing to do (disabled, flat, or unchanged since the last pass).
    Skip,
    /// The loss budget cannot produce a positive trigger price.
    Unattainable,
    /// The exchange already holds a stop within one tick of the target.
    AlreadyCovered { price: Decimal },
    Apply { price: Decimal },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TpDecision {
    Skip,
    Unattainable,
    /// Cancel `cancel_first` (when present), then place at price/qty.
    Replace { price: Decimal, qty: Decimal, cancel_first: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TpOutcome {
    Filled,
    CancelledExternally,
}

/// Per-symbol tracking between passes. The keys capture the position shape
/// a target was computed from; as long as the shape holds, nothing is
/// re-sent.
pub struct GuardState {
    rule: InstrumentRule,
    sl_key: Option<(Decimal, Decimal, Decimal)>,
    tp_key: Option<(Decimal, Decimal)>,
    tp_order_id: Option<String>,
}

impl GuardState {
    pub fn new(rule: InstrumentRule) -> Self {
        Self { rule, sl_key: None, tp_key: None, tp_order_id: None }
    }

    pub fn plan_stop_loss(&self, pos: &Position, settings: &GuardSettings) -> SlDecision {
        if !settings.sl_enabled {
            return SlDecision::Skip;
        }
        let Some(side) = pos.side else { return SlDecision::Skip };
        if pos.size <= Decimal::ZERO {
            return SlDecision::Skip;
        }
        let key = (pos.entry_price, pos.position_value, pos.size);
        if self.sl_key == Some(key) {
            return SlDecision::Skip;
        }
        let Some(raw) = sl_price(side, pos.entry_price, pos.position_value, settings.sl_amount)
        else {
            return SlDecision::Unattainable;
        };
        let px = self.rule.round_price_down(raw);
        if px <= Decimal::ZERO {
            return SlDecision::Unattainable;
        }
        if let Some(cur) = pos.stop_loss {
            if (cur - px).abs() < self.rule.tick_size {
                return SlDecision::AlreadyCovered { price: cur };
            }
        }
        SlDecision::Apply { price: px }
    }

    /// Remember the position shape the current stop loss was computed from.
    pub fn mark_sl(&mut self, pos: &Position) {
        self.sl_key = Some((pos.entry_price, pos.position_value, pos.size));
    }

    pub fn plan_take_profit(&self, pos: &Position, settings: &GuardSettings) -> TpDecision {
        if !settings.tp_enabled {
            return TpDecision::Skip;
        }
        let Some(side) = pos.side else { return TpDecision::Skip };
        if pos.size <= Decimal::ZERO || pos.entry_price <= Decimal::ZERO {
            return TpDecision::Skip;
        }
        let key = (pos.entry_price, pos.size);
        if self.tp_key == Some(key) {
            return TpDecision::Skip;
        }
        let Some(raw) = tp_price(side, pos.entry_price, settings.tp_percent) else {
            return TpDecision::Unattainable;
        };
        let px = self.rule.round_price_down(raw);
        if px <= Decimal::ZERO {
            return TpDecision::Unattainable;
        }
        let qty = self.rule.clamp_qty(pos.size);
        TpDecision::Replace { price: px, qty, cancel_first: self.tp_order_id.clone() }
    }

    pub fn commit_tp(&mut self, pos: &Position, order_id: String) {
        self.tp_key = Some((pos.entry_price, pos.size));
        self.tp_order_id = Some(order_id);
    }

    /// Remember an unattainable target so it is not recomputed every pass.
    pub fn mark_tp_unattainable(&mut self, pos: &Position) {
        self.tp_key = Some((pos.entry_price, pos.size));
    }

    /// Forget the tracked order id without touching the key. Used between a
    /// successful cancel and the replacement placement, so a failed place
    /// leaves no phantom tracking.
    pub fn clear_tp_tracking(&mut self) {
        self.tp_order_id = None;
    }

    pub fn tracked_tp(&self) -> Option<&str> {
        self.tp_order_id.as_deref()
    }

    /// Exchange-side change to the tracked take profit order.
    pub fn on_order_update(&mut self, upd: &OrderUpdate) -> Option<TpOutcome> {
        let tracked = self.tp_order_id.as_deref()?;
        if upd.order_id != tracked {
            return None;
        }
        match upd.status {
            OrderStatus::Filled => {
                self.tp_order_id = None;
                self.tp_key = None;
                Some(TpOutcome::Filled)
            }
            OrderStatus::Cancelled | OrderStatus::Rejected => {
                self.tp_order_id = None;
                self.tp_key = None;
                Some(TpOutcome::CancelledExternally)
            }
            OrderStatus::New | OrderStatus::PartiallyFilled | OrderStatus::Other => None,
        }
    }

    /// Whether the guard holds a live order of its own to cancel. Only a
    /// tracked take profit qualifies; the stop loss rides on the position
    /// and is gone once the position is.
    pub fn needs_flat_sweep(&self) -> bool {
        self.tp_order_id.is_some()
    }

    /// Tracking left over from a position that no longer exists.
    pub fn has_residue(&self) -> bool {
        self.tp_order_id.is_some() || self.tp_key.is_some() || self.sl_key.is_some()
    }

    pub fn reset_after_flat(&mut self) {
        self.sl_key = None;
        self.tp_key = None;
        self.tp_order_id = None;
    }

    /// Settings changed: recompute both targets on the next pass. A tracked
    /// order id survives so the replacement cancels it first.
    pub fn reset_keys(&mut self) {
        self.sl_key = None;
        self.tp_key = None;
    }
}

/// positionIdx candidates: the row's own index first, then the others.
/// One-way rows carry 0; hedge legs carry 1 (long) or 2 (short).
fn idx_ladder(row_idx: u8) -> Vec<u8> {
    let mut v = vec![row_idx];
    for c in [0u8, 1, 2] {
        if !v.contains(&c) {
            v.push(c);
        }
    }
    v
}

/// Only a position-index mismatch moves the ladder to the next rung; any
/// other rejection is final.
fn ladder_retries(e: &ApiError) -> bool {
    e.is_position_idx_mismatch()
}

async fn set_stop_with_fallback(
    client: &BybitClient,
    symbol: &str,
    price: Decimal,
    row_idx: u8,
) -> Result<u8, ApiError> {
    let mut last: Option<ApiError> = None;
    for idx in idx_ladder(row_idx) {
        match client.set_trading_stop(symbol, price, idx).await {
            Ok(()) => return Ok(idx),
            Err(e) if ladder_retries(&e) => {
                debug!(position_idx = idx, "trading-stop rejected the position index, trying next");
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    match last {
        Some(e) => Err(e),
        None => Err(ApiError::EmptyResult),
    }
}

async fn place_tp_with_fallback(
    client: &BybitClient,
    symbol: &str,
    pos: &Position,
    price: Decimal,
    qty: Decimal,
) -> Result<(String, u8), ApiError> {
    let side = match pos.side {
        Some(s) => s.opposite(),
        None => return Err(ApiError::EmptyResult),
    };
    let mut last: Option<ApiError> = None;
    for idx in idx_ladder(pos.position_idx) {
        match client.place_reduce_only_limit(symbol, side, qty, price, idx).await {
            Ok(order_id) => return Ok((order_id, idx)),
            Err(e) if ladder_retries(&e) => {
                debug!(position_idx = idx, "order rejected the position index, trying next");
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    match last {
        Some(e) => Err(e),
        None => Err(ApiError::EmptyResult),
    }
}

/// How a trading-stop submission ended. retCode 34040 means the exchange
/// already holds exactly this stop, which counts as applied.
#[derive(Debug, PartialEq)]
enum StopApplyOutcome {
    Set(u8),
    AlreadyInPlace,
}

fn stop_apply_outcome(res: Result<u8, ApiError>) -> Result<StopApplyOutcome, ApiError> {
    match res {
        Ok(idx) => Ok(StopApplyOutcome::Set(idx)),
        Err(e) if e.is_not_modified() => Ok(StopApplyOutcome::AlreadyInPlace),
        Err(e) => Err(e),
    }
}

async fn guard_stop_loss(
    client: &BybitClient,
    symbol: &str,
    state: &mut GuardState,
    pos: &Position,
    settings: &GuardSettings,
    events: &mpsc::Sender<GuardEvent>,
) -> Result<(), ApiError> {
    match state.plan_stop_loss(pos, settings) {
        SlDecision::Skip => Ok(()),
        SlDecision::Unattainable => {
            UNATTAINABLE_TARGETS.with_label_values(&[symbol, "stop_loss"]).inc();
            warn!(
                entry = %pos.entry_price,
                value = %pos.position_value,
                sl_amount = %settings.sl_amount,
                "stop loss target is not attainable for this position"
            );
            state.mark_sl(pos);
            Ok(())
        }
        SlDecision::AlreadyCovered { price } => {
            debug!(stop_loss = %price, "stop loss already in place");
            state.mark_sl(pos);
            Ok(())
        }
        SlDecision::Apply { price } => {
            let res = set_stop_with_fallback(client, symbol, price, pos.position_idx).await;
            match stop_apply_outcome(res)? {
                StopApplyOutcome::Set(idx) => {
                    state.mark_sl(pos);
                    SL_UPDATES.with_label_values(&[symbol]).inc();
                    info!(stop_loss = %price, position_idx = idx, "stop loss set");
                    let _ = events.try_send(GuardEvent::StopLossSet {
                        symbol: symbol.to_string(),
                        price,
                        position_idx: idx,
                    });
                }
                StopApplyOutcome::AlreadyInPlace => {
                    debug!(stop_loss = %price, "exchange reports the stop unchanged");
                    state.mark_sl(pos);
                }
            }
            Ok(())
        }
    }
}

/// How cancelling the previous take profit ended. An order the exchange no
/// longer knows is already gone; any other failure has to abort the
/// replacement, since the old order may still be live and a second one
/// would double the reduce-only exposure.
#[derive(Debug, PartialEq)]
enum CancelOutcome {
    Cancelled,
    AlreadyGone,
}

fn cancel_outcome(res: Result<(), ApiError>) -> Result<CancelOutcome, ApiError> {
    match res {
        Ok(()) => Ok(CancelOutcome::Cancelled),
        Err(e) if e.is_order_not_found() => Ok(CancelOutcome::AlreadyGone),
        Err(e) => Err(e),
    }
}

async fn guard_take_profit(
    client: &BybitClient,
    symbol: &str,
    state: &mut GuardState,
    pos: &Position,
    settings: &GuardSettings,
    events: &mpsc::Sender<GuardEvent>,
) -> Result<(), ApiError> {
    match state.plan_take_profit(pos, settings) {
        TpDecision::Skip => Ok(()),
        TpDecision::Unattainable => {
            UNATTAINABLE_TARGETS.with_label_values(&[symbol, "take_profit"]).inc();
            warn!(
                entry = %pos.entry_price,
                tp_percent = %settings.tp_percent,
                "take profit target is not attainable for this position"
            );
            state.mark_tp_unattainable(pos);
            Ok(())
        }
        TpDecision::Replace { price, qty, cancel_first } => {
            if let Some(order_id) = cancel_first {
                // A failed cancel leaves the old order possibly live: do
                // not place on top of it, retry the cancel next pass.
                match cancel_outcome(client.cancel_order(symbol, &order_id).await)? {
                    CancelOutcome::Cancelled => {
                        ORDERS_CANCELLED.with_label_values(&[symbol, "replace"]).inc();
                        info!(%order_id, "cancelled previous take profit");
                        let _ = events.try_send(GuardEvent::TakeProfitCancelled {
                            symbol: symbol.to_string(),
                            order_id,
                            reason: "replaced".to_string(),
                        });
                    }
                    CancelOutcome::AlreadyGone => {
                        debug!(%order_id, "previous take profit already gone");
                    }
                }
                state.clear_tp_tracking();
            }
            let (order_id, idx) = place_tp_with_fallback(client, symbol, pos, price, qty).await?;
            state.commit_tp(pos, order_id.clone());
            TP_REPLACEMENTS.with_label_values(&[symbol]).inc();
            info!(%order_id, price = %price, qty = %qty, position_idx = idx, "take profit placed");
            let _ = events.try_send(GuardEvent::TakeProfitPlaced {
                symbol: symbol.to_string(),
                order_id,
                price,
                qty,
            });
            Ok(())
        }
    }
}

async fn sweep_flat(
    client: &BybitClient,
    symbol: &str,
    state: &mut GuardState,
    events: &mpsc::Sender<GuardEvent>,
) -> Result<(), ApiError> {
    if !state.has_residue() {
        return Ok(());
    }
    // Cancel-all only while a take profit order is tracked. Key-only
    // residue means the guard placed nothing that survives the position,
    // and the user's unrelated working orders are not ours to touch.
    if state.needs_flat_sweep() {
        let count = client.cancel_all_orders(symbol).await?;
        info!(count, "position flat, swept remaining orders");
        if count > 0 {
            ORDERS_CANCELLED.with_label_values(&[symbol, "flat_sweep"]).inc_by(count as u64);
            let _ =
                events.try_send(GuardEvent::OrdersCancelled { symbol: symbol.to_string(), count });
        }
    } else {
        info!("position flat, tracking reset");
    }
    state.reset_after_flat();
    POSITION_VALUE_USDT.with_label_values(&[symbol]).set(0);
    POSITION_PNL_BP.with_label_values(&[symbol]).set(0);
    let _ = events.try_send(GuardEvent::PositionFlat { symbol: symbol.to_string() });
    Ok(())
}

/// The row the guard acts on: the first with non-zero size. Hedge mode can
/// leave two legs on one symbol, and a settled row can linger with residual
/// value or uPnL at size zero; neither residue nor the second leg is
/// guarded.
fn guarded_row(positions: &[Position]) -> Option<&Position> {
    positions.iter().find(|p| !p.size.is_zero())
}

/// One pass: reload the position, run both strategies. A failed stop loss
/// pass does not block the take profit pass; the first error is returned
/// after both ran.
async fn guard_cycle(
    client: &BybitClient,
    symbol: &str,
    state: &mut GuardState,
    settings: &GuardSettings,
    events: &mpsc::Sender<GuardEvent>,
) -> Result<(), ApiError> {
    let positions = client.positions_for_symbol(symbol).await?;
    let Some(pos) = guarded_row(&positions) else {
        return sweep_flat(client, symbol, state, events).await;
    };

    monitor::update_position_metrics(&PositionsSummary::from_positions(positions.clone()));

    let mut first_err: Option<ApiError> = None;
    if let Err(e) = guard_stop_loss(client, symbol, state, pos, settings, events).await {
        error!(error = %e, "stop loss pass failed");
        first_err = Some(e);
    }
    if let Err(e) = guard_take_profit(client, symbol, state, pos, settings, events).await {
        error!(error = %e, "take profit pass failed");
        if first_err.is_none() {
            first_err = Some(e);
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[derive(Debug, Error)]
pub enum PrepareError {
    #[error("no open position on {0}")]
    NoOpenPosition(String),
    #[error(transparent)]
    Api(#[from] ApiError),
}

pub struct Prepared {
    pub symbol: String,
    pub rule: InstrumentRule,
    pub position: Position,
}

/// Fetch the instrument rules and confirm there is something to guard.
pub async fn prepare(client: &BybitClient, symbol: &str) -> Result<Prepared, PrepareError> {
    let rule = client.instrument_rule(symbol).await?;
    let positions = client.positions_for_symbol(symbol).await?;
    let position = guarded_row(&positions)
        .cloned()
        .ok_or_else(|| PrepareError::NoOpenPosition(symbol.to_string()))?;
    Ok(Prepared { symbol: symbol.to_string(), rule, position })
}

fn publish_strategy_gauges(s: &GuardSettings) {
    CONFIG_STRATEGY_ACTIVE
        .with_label_values(&["stop_loss"])
        .set(i64::from(s.sl_enabled));
    CONFIG_STRATEGY_ACTIVE
        .with_label_values(&["take_profit"])
        .set(i64::from(s.tp_enabled));
}

pub async fn run(
    client: Arc<BybitClient>,
    symbol: String,
    rule: InstrumentRule,
    poll_secs: u64,
    mut settings_rx: watch::Receiver<GuardSettings>,
    mut order_rx: mpsc::Receiver<OrderUpdate>,
    events: mpsc::Sender<GuardEvent>,
) {
    let mut state = GuardState::new(rule);
    let mut settings = settings_rx.borrow_and_update().clone();
    publish_strategy_gauges(&settings);
    info!(
        %symbol,
        sl_enabled = settings.sl_enabled,
        sl_amount = %settings.sl_amount,
        tp_enabled = settings.tp_enabled,
        tp_percent = %settings.tp_percent,
        "guard started"
    );
    let _ = events.try_send(GuardEvent::Started {
        symbol: symbol.clone(),
        sl_enabled: settings.sl_enabled,
        tp_enabled: settings.tp_enabled,
    });

    let mut tick = interval(Duration::from_secs(poll_secs.max(1)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut settings_alive = true;
    let mut orders_alive = true;

    loop {
        tokio::select! {
            _ = tick.tick() => {
                GUARD_CYCLES.inc();
                if let Err(e) = guard_cycle(&client, &symbol, &mut state, &settings, &events).await {
                    GUARD_CYCLE_ERRORS.inc();
                    if e.is_clock_skew() {
                        CLOCK_SKEW_WARNINGS.inc();
                        warn!("request timestamp rejected, sync the system clock (NTP)");
                    }
                    error!(error = %e, "guard cycle failed, backing off");
                    let _ = events.try_send(GuardEvent::ApiRejected {
                        stage: "guard_cycle".to_string(),
                        message: e.to_string(),
                    });
                    sleep(Duration::from_secs(5)).await;
                }
            }

            res = settings_rx.changed(), if settings_alive => {
                match res {
                    Ok(()) => {
                        let new = settings_rx.borrow_and_update().clone();
                        if new != settings {
                            info!(
                                sl_enabled = new.sl_enabled,
                                sl_amount = %new.sl_amount,
                                tp_enabled = new.tp_enabled,
                                tp_percent = %new.tp_percent,
                                "settings changed, recomputing targets"
                            );
                            let _ = events.try_send(GuardEvent::SettingsChanged {
                                sl_enabled: new.sl_enabled,
                                sl_amount: new.sl_amount,
                                tp_enabled: new.tp_enabled,
                                tp_percent: new.tp_percent,
                            });
                            settings = new;
                            state.reset_keys();
                            publish_strategy_gauges(&settings);
                        }
                    }
                    Err(_) => {
                        warn!("settings watcher gone, keeping last values");
                        settings_alive = false;
                    }
                }
            }

            maybe = order_rx.recv(), if orders_alive => {
                match maybe {
                    Some(upd) => {
                        if upd.symbol == symbol {
                            match state.on_order_update(&upd) {
                                Some(TpOutcome::Filled) => {
                                    TP_FILLS.with_label_values(&[&symbol]).inc();
                                    info!(order_id = %upd.order_id, "take profit filled");
                                    let _ = events.try_send(GuardEvent::TakeProfitFilled {
                                        symbol: symbol.clone(),
                                        order_id: upd.order_id.clone(),
                                    });
                                }
                                Some(TpOutcome::CancelledExternally) => {
                                    info!(order_id = %upd.order_id, "tracked take profit cancelled on the exchange");
                                    let _ = events.try_send(GuardEvent::TakeProfitCancelled {
                                        symbol: symbol.clone(),
                                        order_id: upd.order_id.clone(),
                                        reason: "exchange".to_string(),
                                    });
                                }
                                None => {}
                            }
                        }
                    }
                    None => {
                        warn!("order stream channel closed");
                        orders_alive = false;
                    }
                }
            }
        }
    }
}
