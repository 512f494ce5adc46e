// Stream Shard - One live upstream subscription per (symbol, base interval)
// Owns the authoritative base buffer, derived caches and subscriber fan-out

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::config::EngineConfig;
use crate::core::types::{now_ms, Candle, Interval};
use crate::layer1::rest_client::RestClient;
use crate::layer1::websocket::{backoff_delay, KlineSocket};
use crate::layer2::candle_store::{series_key, CandleStore};
use crate::layer2::parser::LiveParser;
use crate::layer2::resampler::resample;

/// Subscriber delivery callback. Each tick delivers a complete snapshot of
/// the subscriber's target-interval view.
pub type CandleCallback = Arc<dyn Fn(Vec<Candle>) + Send + Sync>;

struct Subscriber {
    target: Interval,
    callback: CandleCallback,
}

struct ShardState {
    base_candles: Vec<Candle>,
    derived: HashMap<Interval, Vec<Candle>>,
    subscribers: HashMap<Uuid, Subscriber>,
    always_active: bool,
    active_targets: HashSet<Interval>,
    destroy_timer: Option<JoinHandle<()>>,
    stream_tasks: Vec<JoinHandle<()>>,
    last_persist_ms: i64,
    ticks_processed: u64,
}

#[derive(Debug, Clone)]
pub struct ShardStats {
    pub symbol: String,
    pub base_interval: Interval,
    pub base_len: usize,
    pub derived_intervals: usize,
    pub subscriber_count: usize,
    pub always_active: bool,
    pub destroy_pending: bool,
    pub ticks_processed: u64,
}

impl fmt::Display for ShardStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Shard({}/{}, base={}, derived={}, subs={}, warm={}, ticks={})",
            self.symbol,
            self.base_interval,
            self.base_len,
            self.derived_intervals,
            self.subscriber_count,
            self.always_active,
            self.ticks_processed
        )
    }
}

/// A shared live subscription. Many strategies read through one shard; the
/// shard keeps the base buffer authoritative and synthesizes target
/// intervals on demand. Destroyed only when no subscriber remains and the
/// shard is not pre-warmed, after a keep-alive delay.
pub struct StreamShard {
    symbol: String,
    base_interval: Interval,
    cfg: Arc<EngineConfig>,
    store: Arc<CandleStore>,
    rest: Arc<RestClient>,
    state: Mutex<ShardState>,
    init_started: AtomicBool,
    destroyed: AtomicBool,
}

impl StreamShard {
    pub fn new(
        symbol: &str,
        base_interval: Interval,
        cfg: Arc<EngineConfig>,
        store: Arc<CandleStore>,
        rest: Arc<RestClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            symbol: symbol.to_uppercase(),
            base_interval,
            cfg,
            store,
            rest,
            state: Mutex::new(ShardState {
                base_candles: Vec::new(),
                derived: HashMap::new(),
                subscribers: HashMap::new(),
                always_active: false,
                active_targets: HashSet::new(),
                destroy_timer: None,
                stream_tasks: Vec::new(),
                last_persist_ms: 0,
                ticks_processed: 0,
            }),
            init_started: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn base_interval(&self) -> Interval {
        self.base_interval
    }

    fn series_key(&self) -> String {
        series_key(&self.symbol, self.base_interval)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Kick off history load + live streaming exactly once. Subscribers may
    /// attach while initialization is still in flight; they see an empty or
    /// partial view until the first refresh.
    pub fn ensure_started(self: &Arc<Self>) {
        if self.init_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let shard = Arc::clone(self);
        let handle = tokio::spawn(async move {
            shard.initialize().await;
            shard.run_stream().await;
        });
        self.state.lock().stream_tasks.push(handle);
    }

    /// Load persisted candles, then top up from the REST API: incrementally
    /// from the last stored candle, or a multi-page deep fetch when the
    /// store was empty. The merged buffer is persisted before streaming.
    async fn initialize(self: &Arc<Self>) {
        let key = self.series_key();
        let persisted = self.store.load_candles(&key);
        info!(
            symbol = %self.symbol,
            interval = %self.base_interval,
            persisted = persisted.len(),
            "Initializing shard"
        );

        let candles = self.fetch_history(persisted).await;
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }

        let snapshot = {
            let mut state = self.state.lock();
            for c in candles {
                insert_candle(&mut state.base_candles, c);
            }
            let cap = self.cfg.base_buffer_cap;
            trim_to_cap(&mut state.base_candles, cap);
            state.last_persist_ms = now_ms();
            state.base_candles.clone()
        };
        self.store.save_candles(&key, &snapshot);
        info!(
            symbol = %self.symbol,
            interval = %self.base_interval,
            candles = snapshot.len(),
            "Shard initialized"
        );
    }

    async fn fetch_history(&self, persisted: Vec<Candle>) -> Vec<Candle> {
        let limit = self.cfg.history_page_limit;
        let mut candles = persisted;

        if let Some(last) = candles.last().map(|c| c.open_time) {
            // Incremental: everything after the last stored candle.
            let mut start = last + 1;
            for _ in 0..self.cfg.deep_fetch_pages {
                let page = self
                    .rest
                    .fetch_klines(&self.symbol, self.base_interval, Some(start), None, limit)
                    .await;
                let fetched = page.len();
                if fetched == 0 {
                    break;
                }
                start = page.last().map(|c| c.open_time + 1).unwrap_or(start);
                for c in page {
                    insert_candle(&mut candles, c);
                }
                if fetched < limit {
                    break;
                }
            }
        } else {
            // Deep fetch, newest page first, walking backwards in time.
            let mut pages: Vec<Vec<Candle>> = Vec::new();
            let mut end: Option<i64> = None;
            for _ in 0..self.cfg.deep_fetch_pages {
                let page = self
                    .rest
                    .fetch_klines(&self.symbol, self.base_interval, None, end, limit)
                    .await;
                if page.is_empty() {
                    break;
                }
                end = page.first().map(|c| c.open_time);
                let short_page = page.len() < limit;
                pages.push(page);
                if short_page {
                    break;
                }
            }
            for page in pages.into_iter().rev() {
                for c in page {
                    insert_candle(&mut candles, c);
                }
            }
        }

        trim_to_cap(&mut candles, self.cfg.base_buffer_cap);
        candles
    }

    /// Live loop: one socket connection at a time, reconnecting with the
    /// configured backoff while the shard is still wanted.
    async fn run_stream(self: &Arc<Self>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let socket = KlineSocket::new(&self.cfg, &self.symbol, self.base_interval);

        let pump_shard = Arc::clone(self);
        let pump = tokio::spawn(async move {
            let mut parser = LiveParser::new();
            while let Some(msg) = rx.recv().await {
                if let Some(candle) = parser.parse(&msg) {
                    pump_shard.apply_tick(candle);
                }
            }
        });
        self.state.lock().stream_tasks.push(pump);

        let mut attempt: u32 = 0;
        loop {
            if self.destroyed.load(Ordering::SeqCst) {
                break;
            }
            match socket.run_once(&tx).await {
                Ok(close) => {
                    debug!(symbol = %self.symbol, close = ?close, "Kline socket ended");
                    attempt = 0;
                }
                Err(e) => {
                    warn!(symbol = %self.symbol, error = %e, "Kline socket failed");
                    attempt = attempt.saturating_add(1);
                }
            }
            if self.destroyed.load(Ordering::SeqCst) || !self.wants_stream() {
                break;
            }
            let delay = backoff_delay(self.cfg.reconnect_delay_secs, attempt);
            warn!(symbol = %self.symbol, delay = ?delay, "Reconnecting kline socket");
            tokio::time::sleep(delay).await;
        }
    }

    /// Reconnect only while someone still wants the data and no destroy is
    /// pending.
    fn wants_stream(&self) -> bool {
        let state = self.state.lock();
        (!state.subscribers.is_empty() || state.always_active) && state.destroy_timer.is_none()
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Register a subscriber and immediately deliver the current view for
    /// its target interval. The delivery happens under the shard lock so a
    /// concurrent tick cannot slip in ahead of the initial snapshot.
    pub fn subscribe(&self, sub_id: Uuid, target: Interval, callback: CandleCallback) {
        let mut state = self.state.lock();
        if let Some(timer) = state.destroy_timer.take() {
            timer.abort();
            debug!(symbol = %self.symbol, "Pending destroy cancelled by subscription");
        }
        let view = self.derived_view(&mut state, target);
        state.subscribers.insert(
            sub_id,
            Subscriber {
                target,
                callback: Arc::clone(&callback),
            },
        );
        callback(view);
        debug!(symbol = %self.symbol, target = %target, sub = %sub_id, "Subscriber added");
    }

    /// Remove a subscriber; target intervals left without subscribers lose
    /// their cache entry.
    pub fn unsubscribe(&self, sub_id: Uuid) {
        let mut state = self.state.lock();
        if state.subscribers.remove(&sub_id).is_none() {
            return;
        }
        let live_targets: HashSet<Interval> =
            state.subscribers.values().map(|s| s.target).collect();
        state.derived.retain(|iv, _| live_targets.contains(iv));
        debug!(symbol = %self.symbol, sub = %sub_id, "Subscriber removed");
    }

    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.subscribers.is_empty() && !state.always_active
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Pre-warm: keep the shard alive with no subscribers and cancel any
    /// pending destroy. Transitions false -> true only.
    pub fn set_always_active(&self) {
        let mut state = self.state.lock();
        state.always_active = true;
        if let Some(timer) = state.destroy_timer.take() {
            timer.abort();
        }
    }

    /// Keep the derived cache for `target` warm on every tick even without
    /// subscribers (pre-warm path).
    pub fn add_active_target(&self, target: Interval) {
        self.state.lock().active_targets.insert(target);
    }

    /// Arm the keep-alive destroy timer. No-op while the shard is pre-warmed
    /// or still has subscribers; if it is still idle when the timer fires it
    /// is destroyed and `on_destroyed` runs.
    pub fn schedule_destroy(self: &Arc<Self>, on_destroyed: Box<dyn FnOnce() + Send>) {
        let mut state = self.state.lock();
        if state.always_active || !state.subscribers.is_empty() || state.destroy_timer.is_some() {
            return;
        }
        let shard = Arc::clone(self);
        let delay = Duration::from_secs(self.cfg.destroy_delay_secs);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if shard.is_idle() && !shard.is_destroyed() {
                shard.destroy();
                on_destroyed();
            }
        });
        state.destroy_timer = Some(handle);
        debug!(symbol = %self.symbol, interval = %self.base_interval, "Destroy scheduled");
    }

    pub fn cancel_destroy(&self) {
        if let Some(timer) = self.state.lock().destroy_timer.take() {
            timer.abort();
        }
    }

    /// Tear down: stop the upstream socket, persist the base buffer, clear
    /// all state. Idempotent.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tasks, snapshot) = {
            let mut state = self.state.lock();
            let tasks = std::mem::take(&mut state.stream_tasks);
            let snapshot = std::mem::take(&mut state.base_candles);
            state.derived.clear();
            state.subscribers.clear();
            state.active_targets.clear();
            if let Some(timer) = state.destroy_timer.take() {
                timer.abort();
            }
            (tasks, snapshot)
        };
        for task in tasks {
            task.abort();
        }
        if !snapshot.is_empty() {
            self.store.save_candles(&self.series_key(), &snapshot);
        }
        info!(symbol = %self.symbol, interval = %self.base_interval, "Shard destroyed");
    }

    // ------------------------------------------------------------------
    // Tick path
    // ------------------------------------------------------------------

    /// Apply one live candle: overwrite the open tail candle or append,
    /// trim past the cap, refresh derived views and fan out snapshots.
    /// Persists at most once per throttle window.
    pub fn apply_tick(&self, candle: Candle) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        if !candle.symbol.eq_ignore_ascii_case(&self.symbol) {
            warn!(
                symbol = %self.symbol,
                got = %candle.symbol,
                "Dropping tick for foreign symbol"
            );
            return;
        }

        let (deliveries, to_persist) = {
            let mut state = self.state.lock();
            insert_candle(&mut state.base_candles, candle);
            let cap = self.cfg.base_buffer_cap;
            trim_to_cap(&mut state.base_candles, cap);
            state.ticks_processed += 1;

            let now = now_ms();
            let to_persist =
                if now - state.last_persist_ms >= (self.cfg.persist_throttle_secs as i64) * 1000 {
                    state.last_persist_ms = now;
                    Some(state.base_candles.clone())
                } else {
                    None
                };

            // Every tick invalidates the whole derived cache; refresh the
            // intervals anyone is watching.
            state.derived.clear();
            let mut wanted: HashSet<Interval> =
                state.subscribers.values().map(|s| s.target).collect();
            if state.always_active {
                wanted.extend(state.active_targets.iter().copied());
            }
            for target in wanted {
                self.derived_view(&mut state, target);
            }

            let deliveries: Vec<(CandleCallback, Vec<Candle>)> = state
                .subscribers
                .values()
                .filter_map(|s| {
                    state
                        .derived
                        .get(&s.target)
                        .map(|view| (Arc::clone(&s.callback), view.clone()))
                })
                .collect();
            (deliveries, to_persist)
        };

        if let Some(snapshot) = to_persist {
            self.store.save_candles(&self.series_key(), &snapshot);
        }
        for (cb, view) in deliveries {
            cb(view);
        }
    }

    /// Current view for a target interval, from cache or recomputed, capped
    /// to the derived buffer limit.
    fn derived_view(&self, state: &mut ShardState, target: Interval) -> Vec<Candle> {
        if let Some(cached) = state.derived.get(&target) {
            return cached.clone();
        }
        let mut view = if target == self.base_interval {
            state.base_candles.clone()
        } else {
            resample(&state.base_candles, self.base_interval, target)
        };
        trim_to_cap(&mut view, self.cfg.derived_buffer_cap);
        state.derived.insert(target, view.clone());
        view
    }

    pub fn stats(&self) -> ShardStats {
        let state = self.state.lock();
        ShardStats {
            symbol: self.symbol.clone(),
            base_interval: self.base_interval,
            base_len: state.base_candles.len(),
            derived_intervals: state.derived.len(),
            subscriber_count: state.subscribers.len(),
            always_active: state.always_active,
            destroy_pending: state.destroy_timer.is_some(),
            ticks_processed: state.ticks_processed,
        }
    }
}

/// Keep the buffer sorted and unique by open time: overwrite the candle with
/// a matching open time, append newer ticks, splice stragglers in place.
fn insert_candle(buf: &mut Vec<Candle>, candle: Candle) {
    match buf.last() {
        None => buf.push(candle),
        Some(last) if last.open_time == candle.open_time => {
            let i = buf.len() - 1;
            buf[i] = candle;
        }
        Some(last) if last.open_time < candle.open_time => buf.push(candle),
        _ => match buf.binary_search_by_key(&candle.open_time, |c| c.open_time) {
            Ok(i) => buf[i] = candle,
            Err(i) => buf.insert(i, candle),
        },
    }
}

/// Drop oldest entries beyond the cap.
fn trim_to_cap(buf: &mut Vec<Candle>, cap: usize) {
    if buf.len() > cap {
        let excess = buf.len() - cap;
        buf.drain(..excess);
    }
}
