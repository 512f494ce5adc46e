// Supervisor - Hosts the strategy set
// Restores snapshots on startup, pre-warms priority symbols, persists the
// full state after mutations, on every order and on a timer

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::core::config::{EngineConfig, StrategyConfig};
use crate::core::types::{now_ms, Direction, TradeOrder};
use crate::layer1::rest_client::RestClient;
use crate::layer2::candle_store::CandleStore;
use crate::layer2::data_engine::DataEngine;
use crate::layer3::strategy::{StrategyEvent, StrategyRuntime, StrategySnapshot};
use crate::layer3::webhook::WebhookDispatcher;

const STRATEGIES_KEY: &str = "strategies";
const LOGS_KEY: &str = "logs";
const ORDER_LOG_CAP: usize = 500;

/// One emitted order as kept in the `logs` entity, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderLogEntry {
    pub strategy_id: String,
    pub strategy_name: String,
    pub received_at: i64,
    pub order: TradeOrder,
}

struct SupervisorInner {
    cfg: Arc<EngineConfig>,
    store: Arc<CandleStore>,
    engine: DataEngine,
    dispatcher: Arc<WebhookDispatcher>,
    strategies: Mutex<HashMap<Uuid, StrategyRuntime>>,
    order_log: Mutex<VecDeque<OrderLogEntry>>,
    events_tx: mpsc::UnboundedSender<StrategyEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<StrategyEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    dirty: AtomicBool,
}

/// The owning root of the engine. Everything shared hangs off this value;
/// there is no process-global state.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    pub fn new(cfg: EngineConfig) -> Self {
        let cfg = Arc::new(cfg);
        let store = Arc::new(CandleStore::new(cfg.data_dir.clone()));
        let rest = Arc::new(RestClient::new(&cfg));
        let engine = DataEngine::new(Arc::clone(&cfg), Arc::clone(&store), rest);
        let dispatcher = Arc::new(WebhookDispatcher::new(cfg.webhook_timeout_secs));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(SupervisorInner {
                cfg,
                store,
                engine,
                dispatcher,
                strategies: Mutex::new(HashMap::new()),
                order_log: Mutex::new(VecDeque::new()),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                tasks: Mutex::new(Vec::new()),
                dirty: AtomicBool::new(false),
            }),
        }
    }

    pub fn engine(&self) -> &DataEngine {
        &self.inner.engine
    }

    // ------------------------------------------------------------------
    // Startup / shutdown
    // ------------------------------------------------------------------

    /// Pre-warm configured symbols, restore persisted strategies and start
    /// them, then run the event pump and the periodic persistence timer.
    pub fn start(&self) {
        for symbol in &self.inner.cfg.prewarm_symbols {
            self.inner.engine.ensure_active(symbol);
        }

        if let Some(log) = self.inner.store.load_json::<Vec<OrderLogEntry>>(LOGS_KEY) {
            *self.inner.order_log.lock() = log.into_iter().take(ORDER_LOG_CAP).collect();
        }
        self.restore_strategies();

        // Event pump: orders append to the log and persist immediately,
        // plain state changes just mark dirty for the timer.
        if let Some(mut rx) = self.inner.events_rx.lock().take() {
            let pump = self.clone();
            let task = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    match event {
                        StrategyEvent::OrderEmitted { id, name, order } => {
                            pump.append_order_log(id, name, order);
                            pump.persist_all();
                        }
                        StrategyEvent::StateChanged { .. } => {
                            pump.inner.dirty.store(true, Ordering::Relaxed);
                        }
                    }
                }
            });
            self.inner.tasks.lock().push(task);
        }

        let ticker = self.clone();
        let period = Duration::from_secs(self.inner.cfg.supervisor_persist_secs.max(1));
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if ticker.inner.dirty.swap(false, Ordering::Relaxed) {
                    ticker.persist_all();
                }
            }
        });
        self.inner.tasks.lock().push(task);

        info!(
            strategies = self.inner.strategies.lock().len(),
            prewarmed = self.inner.cfg.prewarm_symbols.len(),
            "Supervisor started"
        );
    }

    /// Graceful shutdown: stop strategies, destroy shards, persist once more.
    pub fn stop(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        let strategies: Vec<StrategyRuntime> =
            self.inner.strategies.lock().values().cloned().collect();
        for strategy in &strategies {
            strategy.stop();
        }
        self.inner.engine.shutdown();
        self.persist_all();
        info!("Supervisor stopped");
    }

    fn restore_strategies(&self) {
        let snapshots = match self
            .inner
            .store
            .load_json::<Vec<serde_json::Value>>(STRATEGIES_KEY)
        {
            Some(s) => s,
            None => return,
        };

        for raw in snapshots {
            // Config is shallow-merged over the defaults so snapshots from
            // older builds pick up safe defaults for new fields. A strategy
            // that fails to restore is skipped, not fatal.
            let config = match StrategyConfig::merge_snapshot(&raw["config"]) {
                Ok(cfg) => cfg,
                Err(e) => {
                    error!(error = %e, "Skipping unrestorable strategy snapshot");
                    continue;
                }
            };
            let runtime = StrategyRuntime::new(
                config,
                self.inner.engine.clone(),
                Arc::clone(&self.inner.dispatcher),
                self.inner.events_tx.clone(),
            );
            if let (Ok(position), Ok(stats)) = (
                serde_json::from_value(raw["position"].clone()),
                serde_json::from_value(raw["stats"].clone()),
            ) {
                runtime.restore_state(position, stats);
            } else {
                warn!(strategy = %runtime.id(), "Snapshot state unreadable, starting flat");
            }
            runtime.start();
            self.inner.strategies.lock().insert(runtime.id(), runtime);
        }
        info!(
            restored = self.inner.strategies.lock().len(),
            "Strategies restored from snapshot"
        );
    }

    // ------------------------------------------------------------------
    // Operator interface
    // ------------------------------------------------------------------

    pub fn add_strategy(&self, config: StrategyConfig) -> Uuid {
        let runtime = StrategyRuntime::new(
            config,
            self.inner.engine.clone(),
            Arc::clone(&self.inner.dispatcher),
            self.inner.events_tx.clone(),
        );
        let id = runtime.id();
        runtime.start();
        self.inner.strategies.lock().insert(id, runtime);
        self.persist_all();
        info!(strategy = %id, "Strategy added");
        id
    }

    pub fn remove_strategy(&self, id: Uuid) -> bool {
        let removed = self.inner.strategies.lock().remove(&id);
        let found = match removed {
            Some(runtime) => {
                runtime.stop();
                true
            }
            None => false,
        };
        if found {
            self.persist_all();
            info!(strategy = %id, "Strategy removed");
        }
        found
    }

    /// Apply a partial config update (JSON object of changed fields).
    pub fn update_config(&self, id: Uuid, partial: &serde_json::Value) -> bool {
        let runtime = match self.inner.strategies.lock().get(&id) {
            Some(r) => r.clone(),
            None => return false,
        };
        match runtime.config().apply_partial(partial) {
            Ok(new_cfg) => {
                runtime.update_config(new_cfg);
                self.persist_all();
                true
            }
            Err(e) => {
                error!(strategy = %id, error = %e, "Config update rejected");
                false
            }
        }
    }

    pub fn manual_order(&self, id: Uuid, direction: Direction) -> bool {
        let runtime = match self.inner.strategies.lock().get(&id) {
            Some(r) => r.clone(),
            None => return false,
        };
        runtime.manual_order(direction);
        self.persist_all();
        true
    }

    pub fn strategy_ids(&self) -> Vec<Uuid> {
        self.inner.strategies.lock().keys().copied().collect()
    }

    pub fn snapshot(&self, id: Uuid) -> Option<StrategySnapshot> {
        self.inner.strategies.lock().get(&id).map(|r| r.snapshot())
    }

    pub fn order_log(&self) -> Vec<OrderLogEntry> {
        self.inner.order_log.lock().iter().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    fn append_order_log(&self, id: Uuid, name: String, order: TradeOrder) {
        let mut log = self.inner.order_log.lock();
        log.push_front(OrderLogEntry {
            strategy_id: id.to_string(),
            strategy_name: name,
            received_at: now_ms(),
            order,
        });
        log.truncate(ORDER_LOG_CAP);
    }

    fn persist_all(&self) {
        let snapshots: Vec<StrategySnapshot> = self
            .inner
            .strategies
            .lock()
            .values()
            .map(|r| r.snapshot())
            .collect();
        self.inner.store.save_json(STRATEGIES_KEY, &snapshots);

        let log: Vec<OrderLogEntry> = self.inner.order_log.lock().iter().cloned().collect();
        self.inner.store.save_json(LOGS_KEY, &log);
    }
}
