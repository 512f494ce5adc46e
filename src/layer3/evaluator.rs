// Evaluation Core - Deterministic candle-tick state machine
// Pure function: (candles, config, position, stats, date) -> (position, stats, orders)

use crate::core::config::StrategyConfig;
use crate::core::types::{
    format_quantity, Candle, Direction, OrderAction, PositionLabel, PositionState, TradeOrder,
    TradeStats, QTY_EPSILON,
};

/// Minimum history before any decision is taken. Also the implicit guard
/// against unvalidated upstream data reaching the arithmetic below.
pub const MIN_CANDLES: usize = 50;

#[derive(Debug, Clone)]
pub struct EvalOutcome {
    pub position: PositionState,
    pub stats: TradeStats,
    pub orders: Vec<TradeOrder>,
}

// ============================================================================
// Signal detection
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Ema7x25,
    Ema7x99,
    Ema25x99,
    EmaDouble,
    Macd,
}

fn cross_text(kind: SignalKind, above: bool) -> String {
    let verb = if above { "above" } else { "below" };
    match kind {
        SignalKind::Ema7x25 => format!("EMA7 crosses {} 25", verb),
        SignalKind::Ema7x99 => format!("EMA7 crosses {} 99", verb),
        SignalKind::Ema25x99 => format!("EMA25 crosses {} 99", verb),
        SignalKind::EmaDouble => format!("EMA7 or 25 crosses {} 99", verb),
        SignalKind::Macd => format!("MACD crosses {} signal", verb),
    }
}

fn open_reason(kind: SignalKind, direction: Direction) -> String {
    match direction {
        Direction::Long => format!("{} open long", cross_text(kind, true)),
        Direction::Short => format!("{} open short", cross_text(kind, false)),
        Direction::Flat => String::new(),
    }
}

fn close_reason_text(kind: SignalKind, direction: Direction) -> String {
    match direction {
        Direction::Long => format!("{} close long", cross_text(kind, false)),
        Direction::Short => format!("{} close short", cross_text(kind, true)),
        Direction::Flat => String::new(),
    }
}

/// First-match-wins signal selection, independently for each role.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalSet {
    pub long_entry: Option<SignalKind>,
    pub short_entry: Option<SignalKind>,
    pub long_exit: Option<SignalKind>,
    pub short_exit: Option<SignalKind>,
}

fn crossed_over(
    prev_a: Option<f64>,
    prev_b: Option<f64>,
    last_a: Option<f64>,
    last_b: Option<f64>,
) -> bool {
    match (prev_a, prev_b, last_a, last_b) {
        (Some(pa), Some(pb), Some(la), Some(lb)) => pa <= pb && la > lb,
        _ => false,
    }
}

fn crossed_under(
    prev_a: Option<f64>,
    prev_b: Option<f64>,
    last_a: Option<f64>,
    last_b: Option<f64>,
) -> bool {
    match (prev_a, prev_b, last_a, last_b) {
        (Some(pa), Some(pb), Some(la), Some(lb)) => pa >= pb && la < lb,
        _ => false,
    }
}

/// Evaluate all five cross signals between the previous and last candle, in
/// precedence order: EMA7/25, EMA7/99, EMA25/99, double, MACD. The long
/// side of a signal serves entries on the up-cross and exits on the
/// down-cross; the short side is symmetric.
pub fn detect_signals(prev: &Candle, last: &Candle, cfg: &StrategyConfig) -> SignalSet {
    let mut set = SignalSet::default();

    let over_7_99 = crossed_over(prev.ema7, prev.ema99, last.ema7, last.ema99);
    let under_7_99 = crossed_under(prev.ema7, prev.ema99, last.ema7, last.ema99);
    let over_25_99 = crossed_over(prev.ema25, prev.ema99, last.ema25, last.ema99);
    let under_25_99 = crossed_under(prev.ema25, prev.ema99, last.ema25, last.ema99);

    let checks: [(SignalKind, bool, bool, bool, bool, bool); 5] = [
        (
            SignalKind::Ema7x25,
            cfg.use_ema7_25,
            cfg.ema7_25_long,
            cfg.ema7_25_short,
            crossed_over(prev.ema7, prev.ema25, last.ema7, last.ema25),
            crossed_under(prev.ema7, prev.ema25, last.ema7, last.ema25),
        ),
        (
            SignalKind::Ema7x99,
            cfg.use_ema7_99,
            cfg.ema7_99_long,
            cfg.ema7_99_short,
            over_7_99,
            under_7_99,
        ),
        (
            SignalKind::Ema25x99,
            cfg.use_ema25_99,
            cfg.ema25_99_long,
            cfg.ema25_99_short,
            over_25_99,
            under_25_99,
        ),
        (
            SignalKind::EmaDouble,
            cfg.use_ema_double,
            cfg.ema_double_long,
            cfg.ema_double_short,
            over_7_99 || over_25_99,
            under_7_99 || under_25_99,
        ),
        (
            SignalKind::Macd,
            cfg.use_macd,
            cfg.macd_long,
            cfg.macd_short,
            crossed_over(prev.macd_line, prev.macd_signal, last.macd_line, last.macd_signal),
            crossed_under(prev.macd_line, prev.macd_signal, last.macd_line, last.macd_signal),
        ),
    ];

    for (kind, enabled, long_ok, short_ok, up, down) in checks {
        if !enabled {
            continue;
        }
        if long_ok {
            if up && set.long_entry.is_none() {
                set.long_entry = Some(kind);
            }
            if down && set.long_exit.is_none() {
                set.long_exit = Some(kind);
            }
        }
        if short_ok {
            if down && set.short_entry.is_none() {
                set.short_entry = Some(kind);
            }
            if up && set.short_exit.is_none() {
                set.short_exit = Some(kind);
            }
        }
    }
    set
}

// ============================================================================
// Order construction
// ============================================================================

pub fn order_for_open(
    cfg: &StrategyConfig,
    direction: Direction,
    qty: f64,
    price: f64,
    reason: &str,
    timestamp: i64,
) -> TradeOrder {
    let (action, label) = match direction {
        Direction::Long => (OrderAction::Buy, PositionLabel::Long),
        _ => (OrderAction::Sell, PositionLabel::Short),
    };
    build_order(cfg, action, label, qty, price, reason, timestamp)
}

/// Closing a long sells, closing a short buys. Partial closes carry the
/// still-open direction; full closes are labelled flat.
pub fn order_for_close(
    cfg: &StrategyConfig,
    closing: Direction,
    label: PositionLabel,
    qty: f64,
    price: f64,
    reason: &str,
    timestamp: i64,
) -> TradeOrder {
    let action = match closing {
        Direction::Long => OrderAction::Sell,
        _ => OrderAction::Buy,
    };
    build_order(cfg, action, label, qty, price, reason, timestamp)
}

fn build_order(
    cfg: &StrategyConfig,
    action: OrderAction,
    position: PositionLabel,
    qty: f64,
    price: f64,
    reason: &str,
    timestamp: i64,
) -> TradeOrder {
    TradeOrder {
        action,
        position,
        symbol: cfg.symbol.clone(),
        quantity: format_quantity(qty),
        trade_amount: qty * price,
        leverage: cfg.leverage,
        timestamp,
        tv_exchange: cfg.tv_exchange.clone(),
        strategy_name: cfg.name.clone(),
        tp_level: reason.to_string(),
        execution_price: price,
        execution_quantity: qty,
    }
}

// ============================================================================
// Evaluation
// ============================================================================

/// One tick of the strategy state machine. Total: never fails, returns the
/// inputs unchanged when the preconditions do not hold. `today` is the
/// injected UTC date key and `now` the injected timestamp so the function
/// stays deterministic under test.
pub fn evaluate(
    candles: &[Candle],
    cfg: &StrategyConfig,
    position: &PositionState,
    stats: &TradeStats,
    today: &str,
    now: i64,
) -> EvalOutcome {
    let mut position = position.clone();
    let mut stats = stats.clone();
    let mut orders: Vec<TradeOrder> = Vec::new();

    if candles.len() < MIN_CANDLES || !cfg.is_active {
        return EvalOutcome { position, stats, orders };
    }
    let last = &candles[candles.len() - 1];
    let prev = &candles[candles.len() - 2];
    let (e7, e25, e99) = match (last.ema7, last.ema25, last.ema99) {
        (Some(a), Some(b), Some(c)) => (a, b, c),
        _ => return EvalOutcome { position, stats, orders },
    };

    stats.roll_over(today);
    let can_open = stats.daily_trade_count < cfg.max_daily_trades;

    // EMA/MACD signals respect the trigger mode; TP/SL and trailing always
    // evaluate, on every tick.
    let signal_gate = !cfg.trigger_on_close || last.is_closed;
    let signals = if signal_gate {
        detect_signals(prev, last, cfg)
    } else {
        SignalSet::default()
    };

    let trend_long = e7 > e25 && e25 > e99;
    let trend_short = e7 < e25 && e25 < e99;
    let block_long = cfg.trend_filter_block_long && trend_short;
    let block_short = cfg.trend_filter_block_short && trend_long;

    let price = last.close;

    if !position.is_flat() {
        run_exits(
            candles, cfg, &mut position, &mut stats, &mut orders, &signals, today, now, can_open,
        );
        return EvalOutcome { position, stats, orders };
    }

    // Entry lifecycle. Automatic entries are suppressed under manual
    // takeover and by the daily trade cap.
    if !can_open || cfg.manual_takeover {
        return EvalOutcome { position, stats, orders };
    }

    let long_entry = signals.long_entry.filter(|_| !block_long);
    let short_entry = signals.short_entry.filter(|_| !block_short);

    if !cfg.use_reversion_entry {
        if let Some(kind) = long_entry {
            open_position(cfg, &mut position, &mut orders, Direction::Long, last, &open_reason(kind, Direction::Long), now);
        } else if let Some(kind) = short_entry {
            open_position(cfg, &mut position, &mut orders, Direction::Short, last, &open_reason(kind, Direction::Short), now);
        }
        return EvalOutcome { position, stats, orders };
    }

    // Deferred reversion mode: remember the signal, wait for price to pull
    // back to the EMA7 target before entering.
    match position.pending_reversion {
        None => {
            if let Some(kind) = long_entry {
                position.pending_reversion = Some(Direction::Long);
                position.pending_reversion_reason = Some(open_reason(kind, Direction::Long));
            } else if let Some(kind) = short_entry {
                position.pending_reversion = Some(Direction::Short);
                position.pending_reversion_reason = Some(open_reason(kind, Direction::Short));
            }
        }
        Some(pending) => {
            let target = e7 * (1.0 + cfg.reversion_pct / 100.0);
            let triggered = match pending {
                Direction::Long => price <= target,
                Direction::Short => price >= target,
                Direction::Flat => false,
            };
            if triggered {
                let reason = format!(
                    "{} (reverted to EMA7)",
                    position.pending_reversion_reason.clone().unwrap_or_default()
                );
                position.pending_reversion = None;
                position.pending_reversion_reason = None;
                open_position(cfg, &mut position, &mut orders, pending, last, &reason, now);
            } else {
                // An opposite signal flips the pending side and keeps waiting.
                match pending {
                    Direction::Long => {
                        if let Some(kind) = short_entry {
                            position.pending_reversion = Some(Direction::Short);
                            position.pending_reversion_reason =
                                Some(open_reason(kind, Direction::Short));
                        }
                    }
                    Direction::Short => {
                        if let Some(kind) = long_entry {
                            position.pending_reversion = Some(Direction::Long);
                            position.pending_reversion_reason =
                                Some(open_reason(kind, Direction::Long));
                        }
                    }
                    Direction::Flat => {}
                }
            }
        }
    }

    EvalOutcome { position, stats, orders }
}

/// Exit ladder for an open position, tried in order: signal exit, fixed
/// TP/SL, trailing stop, multi-level ladders, exhaustion cleanup. Signal
/// exits fire even under manual takeover.
#[allow(clippy::too_many_arguments)]
fn run_exits(
    candles: &[Candle],
    cfg: &StrategyConfig,
    position: &mut PositionState,
    stats: &mut TradeStats,
    orders: &mut Vec<TradeOrder>,
    signals: &SignalSet,
    today: &str,
    now: i64,
    can_open: bool,
) {
    let last = &candles[candles.len() - 1];
    let price = last.close;
    let entry = position.entry_price;
    let direction = position.direction;

    let mut close: Option<(String, bool)> = None; // (reason, was a signal exit)

    let signal_exit = match direction {
        Direction::Long => signals.long_exit,
        Direction::Short => signals.short_exit,
        Direction::Flat => None,
    };

    if let Some(kind) = signal_exit {
        close = Some((close_reason_text(kind, direction), true));
    } else if cfg.use_fixed_tpsl && !cfg.use_trailing_stop && !cfg.use_multi_tpsl {
        let (tp_hit, sl_hit) = match direction {
            Direction::Long => (
                last.high >= entry * (1.0 + cfg.take_profit_pct / 100.0),
                last.low <= entry * (1.0 - cfg.stop_loss_pct / 100.0),
            ),
            _ => (
                last.low <= entry * (1.0 - cfg.take_profit_pct / 100.0),
                last.high >= entry * (1.0 + cfg.stop_loss_pct / 100.0),
            ),
        };
        if tp_hit {
            close = Some(("fixed TP".to_string(), false));
        } else if sl_hit {
            close = Some(("fixed SL".to_string(), false));
        }
    } else if cfg.use_trailing_stop {
        // Track the post-update extremum, then check activation + distance.
        // The extremum is monotone, so arming is one-shot for the position.
        match direction {
            Direction::Long => {
                position.highest_price = position.highest_price.max(last.high);
                let activation = entry * (1.0 + cfg.trailing_activation_pct / 100.0);
                let stop = position.highest_price * (1.0 - cfg.trailing_distance_pct / 100.0);
                if position.highest_price >= activation && last.low <= stop {
                    close = Some(("trailing stop".to_string(), false));
                }
            }
            _ => {
                position.lowest_price = position.lowest_price.min(last.low);
                let activation = entry * (1.0 - cfg.trailing_activation_pct / 100.0);
                let stop = position.lowest_price * (1.0 + cfg.trailing_distance_pct / 100.0);
                if position.lowest_price <= activation && last.high >= stop {
                    close = Some(("trailing stop".to_string(), false));
                }
            }
        }
    } else if cfg.use_multi_tpsl {
        run_ladders(cfg, position, orders, last, now);
        if position.remaining_qty <= QTY_EPSILON {
            close = Some(("all levels reached".to_string(), false));
        }
    }

    let Some((reason, was_signal)) = close else {
        return;
    };

    // Full close: one order for whatever quantity is left, then flatten.
    if position.remaining_qty > QTY_EPSILON {
        orders.push(order_for_close(
            cfg,
            direction,
            PositionLabel::Flat,
            position.remaining_qty,
            price,
            &reason,
            now,
        ));
    }
    *position = PositionState::flat();
    stats.daily_trade_count += 1;
    stats.last_trade_date = today.to_string();

    // Optional immediate reversal, only for signal exits and only while
    // automatic trading is allowed to open.
    if was_signal && cfg.use_reverse && !cfg.manual_takeover && can_open && price > 0.0 {
        let allowed = match direction {
            Direction::Long => cfg.reverse_long_to_short,
            Direction::Short => cfg.reverse_short_to_long,
            Direction::Flat => false,
        };
        if allowed {
            let new_direction = direction.opposite();
            let qty = cfg.trade_amount / price;
            *position = PositionState::open(new_direction, qty, price, last.open_time);
            // Extremes seed from the candle, not the close.
            position.highest_price = last.high;
            position.lowest_price = last.low;
            let reverse_reason = match new_direction {
                Direction::Long => "reverse open long",
                _ => "reverse open short",
            };
            orders.push(order_for_open(cfg, new_direction, qty, price, reverse_reason, now));
        }
    }
}

/// Multi-level TP then SL ladders. Each active, un-hit level whose target
/// the candle touched closes `min(initial * qty_pct, remaining)` and is
/// flagged so it never fires again for this position.
fn run_ladders(
    cfg: &StrategyConfig,
    position: &mut PositionState,
    orders: &mut Vec<TradeOrder>,
    last: &Candle,
    now: i64,
) {
    let entry = position.entry_price;
    let direction = position.direction;
    let price = last.close;
    let label = match direction {
        Direction::Long => PositionLabel::Long,
        _ => PositionLabel::Short,
    };

    for (i, level) in cfg.tp_levels.iter().enumerate() {
        if !level.active
            || position.tp_levels_hit.contains(&i)
            || position.remaining_qty <= QTY_EPSILON
        {
            continue;
        }
        let hit = match direction {
            Direction::Long => last.high >= entry * (1.0 + level.pct / 100.0),
            _ => last.low <= entry * (1.0 - level.pct / 100.0),
        };
        if hit {
            let qty = (position.initial_qty * level.qty_pct / 100.0).min(position.remaining_qty);
            orders.push(order_for_close(
                cfg,
                direction,
                label,
                qty,
                price,
                &format!("TP level {}", i + 1),
                now,
            ));
            position.tp_levels_hit.push(i);
            position.remaining_qty -= qty;
        }
    }

    for (i, level) in cfg.sl_levels.iter().enumerate() {
        if !level.active
            || position.sl_levels_hit.contains(&i)
            || position.remaining_qty <= QTY_EPSILON
        {
            continue;
        }
        // A short's stop loss sits above entry, so the roles of high and low
        // swap relative to the TP ladder.
        let hit = match direction {
            Direction::Long => last.low <= entry * (1.0 - level.pct / 100.0),
            _ => last.high >= entry * (1.0 + level.pct / 100.0),
        };
        if hit {
            let qty = (position.initial_qty * level.qty_pct / 100.0).min(position.remaining_qty);
            orders.push(order_for_close(
                cfg,
                direction,
                label,
                qty,
                price,
                &format!("SL level {}", i + 1),
                now,
            ));
            position.sl_levels_hit.push(i);
            position.remaining_qty -= qty;
        }
    }
}

fn open_position(
    cfg: &StrategyConfig,
    position: &mut PositionState,
    orders: &mut Vec<TradeOrder>,
    direction: Direction,
    last: &Candle,
    reason: &str,
    now: i64,
) {
    let price = last.close;
    if price <= 0.0 {
        return;
    }
    let qty = cfg.trade_amount / price;
    *position = PositionState::open(direction, qty, price, last.open_time);
    orders.push(order_for_open(cfg, direction, qty, price, reason, now));
}
