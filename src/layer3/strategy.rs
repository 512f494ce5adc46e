// Strategy Runtime - Per-strategy lifecycle around the evaluation core
// Subscribes to the data engine, enriches batches, applies outcomes,
// dispatches orders and reports state changes to the supervisor

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::config::StrategyConfig;
use crate::core::types::{
    now_ms, utc_day, Candle, Direction, Interval, PositionLabel, PositionState, TradeOrder,
    TradeStats, QTY_EPSILON,
};
use crate::layer2::data_engine::DataEngine;
use crate::layer2::stream_shard::CandleCallback;
use crate::layer3::evaluator::{evaluate, order_for_close, order_for_open};
use crate::layer3::indicators::enrich;
use crate::layer3::webhook::WebhookDispatcher;

/// Notifications from a strategy to its supervisor.
#[derive(Debug, Clone)]
pub enum StrategyEvent {
    StateChanged { id: Uuid },
    OrderEmitted { id: Uuid, name: String, order: TradeOrder },
}

/// Persisted form of one strategy: config plus live state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySnapshot {
    pub config: StrategyConfig,
    pub position: PositionState,
    pub stats: TradeStats,
}

#[derive(Debug, Clone, Default)]
pub struct StrategyStats {
    pub batches_processed: u64,
    pub batches_dropped: u64,
    pub identity_rejects: u64,
    pub orders_emitted: u64,
}

impl fmt::Display for StrategyStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Strategy(batches={}, dropped={}, rejects={}, orders={})",
            self.batches_processed, self.batches_dropped, self.identity_rejects, self.orders_emitted
        )
    }
}

struct StrategyState {
    cfg: StrategyConfig,
    position: PositionState,
    stats: TradeStats,
    last_price: f64,
    candles: Vec<Candle>,
}

struct StrategyInner {
    id: Uuid,
    engine: DataEngine,
    dispatcher: Arc<WebhookDispatcher>,
    events: mpsc::UnboundedSender<StrategyEvent>,
    state: Mutex<StrategyState>,
    batch_task: Mutex<Option<JoinHandle<()>>>,
    counters: Mutex<StrategyStats>,
}

/// One running strategy. All mutation goes through the per-strategy lock;
/// batch handling, manual orders and config updates are serialized on it.
#[derive(Clone)]
pub struct StrategyRuntime {
    inner: Arc<StrategyInner>,
}

impl StrategyRuntime {
    pub fn new(
        mut cfg: StrategyConfig,
        engine: DataEngine,
        dispatcher: Arc<WebhookDispatcher>,
        events: mpsc::UnboundedSender<StrategyEvent>,
    ) -> Self {
        let id = cfg
            .id
            .parse::<Uuid>()
            .unwrap_or_else(|_| Uuid::new_v4());
        cfg.id = id.to_string();

        Self {
            inner: Arc::new(StrategyInner {
                id,
                engine,
                dispatcher,
                events,
                state: Mutex::new(StrategyState {
                    cfg,
                    position: PositionState::flat(),
                    stats: TradeStats::default(),
                    last_price: 0.0,
                    candles: Vec::new(),
                }),
                batch_task: Mutex::new(None),
                counters: Mutex::new(StrategyStats::default()),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn name(&self) -> String {
        self.inner.state.lock().cfg.name.clone()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Subscribe to the data engine for the configured (symbol, interval).
    /// Batches flow through a bounded channel into a dedicated task so the
    /// shard's tick path never waits on evaluation.
    pub fn start(&self) {
        let (symbol, interval) = {
            let state = self.inner.state.lock();
            (state.cfg.symbol.clone(), state.cfg.interval)
        };

        let (tx, mut rx) = mpsc::channel::<Vec<Candle>>(64);
        let worker = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                worker.handle_batch(batch);
            }
        });
        if let Some(old) = self.inner.batch_task.lock().replace(task) {
            old.abort();
        }

        let drop_counter = Arc::clone(&self.inner);
        let callback: CandleCallback = Arc::new(move |candles| {
            // Each delivery is a complete snapshot; when the queue is full
            // the newest batch supersedes whatever we failed to enqueue.
            if tx.try_send(candles).is_err() {
                drop_counter.counters.lock().batches_dropped += 1;
            }
        });
        self.inner.engine.subscribe(self.inner.id, &symbol, interval, callback);
        info!(strategy = %self.inner.id, symbol = %symbol, interval = %interval, "Strategy started");
    }

    pub fn stop(&self) {
        let (symbol, interval) = {
            let state = self.inner.state.lock();
            (state.cfg.symbol.clone(), state.cfg.interval)
        };
        self.stop_subscription(&symbol, interval);
        info!(strategy = %self.inner.id, "Strategy stopped");
    }

    fn stop_subscription(&self, symbol: &str, interval: Interval) {
        self.inner.engine.unsubscribe(self.inner.id, symbol, interval);
        if let Some(task) = self.inner.batch_task.lock().take() {
            task.abort();
        }
    }

    /// Replace the config. A symbol or interval change resubscribes from
    /// scratch; a manual-takeover false -> true transition installs the
    /// synthetic takeover position.
    pub fn update_config(&self, new_cfg: StrategyConfig) {
        let (resubscribe, takeover_started, old_symbol, old_interval) = {
            let mut state = self.inner.state.lock();
            let old = &state.cfg;
            let resubscribe = !old.symbol.eq_ignore_ascii_case(&new_cfg.symbol)
                || old.interval != new_cfg.interval;
            let takeover_started = !old.manual_takeover && new_cfg.manual_takeover;
            let old_symbol = old.symbol.clone();
            let old_interval = old.interval;
            state.cfg = new_cfg;
            (resubscribe, takeover_started, old_symbol, old_interval)
        };

        if resubscribe {
            self.stop_subscription(&old_symbol, old_interval);
            self.inner.state.lock().candles.clear();
            self.start();
        }
        if takeover_started {
            self.init_manual_takeover();
        }
        let _ = self
            .inner
            .events
            .send(StrategyEvent::StateChanged { id: self.inner.id });
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    pub fn snapshot(&self) -> StrategySnapshot {
        let state = self.inner.state.lock();
        StrategySnapshot {
            config: state.cfg.clone(),
            position: state.position.clone(),
            stats: state.stats.clone(),
        }
    }

    /// Re-install a persisted position and stats after a restart.
    pub fn restore_state(&self, position: PositionState, stats: TradeStats) {
        let mut state = self.inner.state.lock();
        state.position = position;
        state.stats = stats;
        debug!(strategy = %self.inner.id, position = %state.position, "State restored");
    }

    pub fn config(&self) -> StrategyConfig {
        self.inner.state.lock().cfg.clone()
    }

    /// Latest enriched view the strategy evaluated, for the UI push layer.
    pub fn candles(&self) -> Vec<Candle> {
        self.inner.state.lock().candles.clone()
    }

    pub fn stats(&self) -> StrategyStats {
        self.inner.counters.lock().clone()
    }

    /// Feed one candle batch through the runtime. Exposed so tests and the
    /// shard callback share one path.
    pub fn process_batch(&self, batch: Vec<Candle>) {
        self.inner.handle_batch(batch);
    }

    // ------------------------------------------------------------------
    // Manual flows
    // ------------------------------------------------------------------

    /// Operator-driven order: LONG/SHORT installs a fresh position sized
    /// from the trade amount, FLAT closes whatever remains. Requires a seen
    /// price; division by zero is guarded by the early return.
    pub fn manual_order(&self, direction: Direction) {
        let now = now_ms();
        let orders = {
            let mut state = self.inner.state.lock();
            let price = state.last_price;
            if price <= 0.0 {
                warn!(strategy = %self.inner.id, "Manual order ignored, no price seen yet");
                return;
            }
            let mut orders = Vec::new();
            match direction {
                Direction::Long | Direction::Short => {
                    let qty = state.cfg.trade_amount / price;
                    state.position = PositionState::open(direction, qty, price, now);
                    state.stats.daily_trade_count += 1;
                    state.stats.last_trade_date = utc_day(now);
                    let reason = match direction {
                        Direction::Long => "manual long",
                        _ => "manual short",
                    };
                    orders.push(order_for_open(&state.cfg, direction, qty, price, reason, now));
                }
                Direction::Flat => {
                    if state.position.is_flat() {
                        return;
                    }
                    let qty = state.position.remaining_qty;
                    let closing = state.position.direction;
                    state.position = PositionState::flat();
                    if qty > QTY_EPSILON {
                        orders.push(order_for_close(
                            &state.cfg,
                            closing,
                            PositionLabel::Flat,
                            qty,
                            price,
                            "manual flat",
                            now,
                        ));
                    }
                }
            }
            orders
        };
        self.emit_orders(orders);
    }

    /// Manual takeover initializer: install the synthetic position described
    /// by the takeover fields and announce it with an Init order. A FLAT
    /// takeover direction just resets the position.
    fn init_manual_takeover(&self) {
        let now = now_ms();
        let orders = {
            let mut state = self.inner.state.lock();
            let direction = state.cfg.takeover_direction;
            if direction == Direction::Flat {
                state.position = PositionState::flat();
                info!(strategy = %self.inner.id, "Manual takeover with flat direction, position reset");
                return;
            }
            let price = state.last_price;
            if price <= 0.0 {
                warn!(strategy = %self.inner.id, "Manual takeover without a price, position not installed");
                return;
            }
            let qty = state.cfg.takeover_quantity;
            state.position = PositionState::open(direction, qty, price, now);
            vec![order_for_open(&state.cfg, direction, qty, price, "Init", now)]
        };
        self.emit_orders(orders);
    }

    fn emit_orders(&self, orders: Vec<TradeOrder>) {
        if orders.is_empty() {
            return;
        }
        let (urls, name) = {
            let state = self.inner.state.lock();
            (state.cfg.webhook_urls.clone(), state.cfg.name.clone())
        };
        for order in orders {
            self.inner.counters.lock().orders_emitted += 1;
            self.inner.dispatcher.dispatch(&urls, &order);
            let _ = self.inner.events.send(StrategyEvent::OrderEmitted {
                id: self.inner.id,
                name: name.clone(),
                order,
            });
        }
        let _ = self
            .inner
            .events
            .send(StrategyEvent::StateChanged { id: self.inner.id });
    }
}

impl StrategyInner {
    /// One candle batch: identity check, then price update, enrichment,
    /// evaluation, order dispatch and supervisor notification, in that order.
    fn handle_batch(&self, mut batch: Vec<Candle>) {
        if batch.is_empty() {
            return;
        }

        let (orders, urls, name) = {
            let mut state = self.state.lock();

            // Identity discipline: a batch for a different symbol means the
            // routing layer mis-delivered; never let it touch state.
            let got = batch[0].symbol.clone();
            if !got.eq_ignore_ascii_case(&state.cfg.symbol) {
                error!(
                    strategy = %self.id,
                    expected = %state.cfg.symbol,
                    got = %got,
                    "Candle batch symbol mismatch, dropping batch"
                );
                self.counters.lock().identity_rejects += 1;
                return;
            }

            state.last_price = batch.last().map(|c| c.close).unwrap_or(0.0);
            enrich(
                &mut batch,
                state.cfg.macd_fast,
                state.cfg.macd_slow,
                state.cfg.macd_signal,
            );

            let now = now_ms();
            let today = utc_day(now);
            let outcome = evaluate(&batch, &state.cfg, &state.position, &state.stats, &today, now);
            state.position = outcome.position;
            state.stats = outcome.stats;
            state.candles = batch;
            self.counters.lock().batches_processed += 1;

            (
                outcome.orders,
                state.cfg.webhook_urls.clone(),
                state.cfg.name.clone(),
            )
        };

        for order in orders {
            self.counters.lock().orders_emitted += 1;
            self.dispatcher.dispatch(&urls, &order);
            let _ = self.events.send(StrategyEvent::OrderEmitted {
                id: self.id,
                name: name.clone(),
                order,
            });
        }
        let _ = self.events.send(StrategyEvent::StateChanged { id: self.id });
    }
}
