// Data Engine - Registry of stream shards keyed by (symbol, base interval)
// Routes (symbol, target interval) requests to the shard that can serve them

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::config::EngineConfig;
use crate::core::types::Interval;
use crate::layer1::rest_client::RestClient;
use crate::layer2::candle_store::CandleStore;
use crate::layer2::stream_shard::{CandleCallback, ShardStats, StreamShard};

type ShardKey = (String, Interval);

#[derive(Debug, Clone)]
pub struct EngineStats {
    pub shard_count: usize,
    pub shards: Vec<ShardStats>,
}

impl fmt::Display for EngineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataEngine(shards={})", self.shard_count)
    }
}

struct EngineInner {
    cfg: Arc<EngineConfig>,
    store: Arc<CandleStore>,
    rest: Arc<RestClient>,
    shards: Mutex<HashMap<ShardKey, Arc<StreamShard>>>,
}

/// The shard registry. Owned by the supervisor and cloned into strategy
/// runtimes; one coarse lock guards the map, each shard serializes its own
/// state behind its own lock.
#[derive(Clone)]
pub struct DataEngine {
    inner: Arc<EngineInner>,
}

impl DataEngine {
    pub fn new(cfg: Arc<EngineConfig>, store: Arc<CandleStore>, rest: Arc<RestClient>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                cfg,
                store,
                rest,
                shards: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe a strategy to (symbol, target interval). The target is
    /// resolved to its base interval; the serving shard is created and
    /// started on first use. The callback receives an immediate snapshot,
    /// possibly empty while the shard is still initializing.
    pub fn subscribe(
        &self,
        strategy_id: Uuid,
        symbol: &str,
        target: Interval,
        callback: CandleCallback,
    ) {
        let shard = self.get_or_create(symbol, target.base());
        shard.subscribe(strategy_id, target, callback);
        shard.ensure_started();
    }

    /// Remove a strategy's subscription. An idle, non-pre-warmed shard is
    /// scheduled for destruction and unregistered once the timer fires.
    pub fn unsubscribe(&self, strategy_id: Uuid, symbol: &str, target: Interval) {
        let key = shard_key(symbol, target.base());
        let shard = match self.inner.shards.lock().get(&key) {
            Some(shard) => Arc::clone(shard),
            None => return,
        };
        shard.unsubscribe(strategy_id);

        if shard.is_idle() {
            let registry: Weak<EngineInner> = Arc::downgrade(&self.inner);
            let drop_key = key.clone();
            shard.schedule_destroy(Box::new(move || {
                if let Some(inner) = registry.upgrade() {
                    inner.shards.lock().remove(&drop_key);
                    debug!(symbol = %drop_key.0, interval = %drop_key.1, "Shard unregistered");
                }
            }));
        }
    }

    /// Pre-warm every supported target interval for a symbol: the base
    /// shards are created, marked always-active and start initializing
    /// immediately. Subscribing while initialization runs is fine.
    pub fn ensure_active(&self, symbol: &str) {
        info!(symbol = symbol, "Pre-warming shards for symbol");
        for target in Interval::ALL {
            let shard = self.get_or_create(symbol, target.base());
            shard.set_always_active();
            shard.add_active_target(target);
            shard.ensure_started();
        }
    }

    fn get_or_create(&self, symbol: &str, base: Interval) -> Arc<StreamShard> {
        let key = shard_key(symbol, base);
        let mut shards = self.inner.shards.lock();
        if let Some(existing) = shards.get(&key) {
            if !existing.is_destroyed() {
                return Arc::clone(existing);
            }
        }
        let shard = StreamShard::new(
            symbol,
            base,
            Arc::clone(&self.inner.cfg),
            Arc::clone(&self.inner.store),
            Arc::clone(&self.inner.rest),
        );
        shards.insert(key, Arc::clone(&shard));
        debug!(symbol = symbol, interval = %base, "Shard created");
        shard
    }

    /// Direct shard access for tests and the supervisor's stats surface.
    pub fn shard(&self, symbol: &str, base: Interval) -> Option<Arc<StreamShard>> {
        self.inner
            .shards
            .lock()
            .get(&shard_key(symbol, base))
            .cloned()
    }

    /// Destroy every shard; used on graceful shutdown.
    pub fn shutdown(&self) {
        let shards: Vec<Arc<StreamShard>> = self.inner.shards.lock().values().cloned().collect();
        for shard in &shards {
            shard.destroy();
        }
        self.inner.shards.lock().clear();
        info!(count = shards.len(), "Data engine shut down");
    }

    pub fn stats(&self) -> EngineStats {
        let shards = self.inner.shards.lock();
        EngineStats {
            shard_count: shards.len(),
            shards: shards.values().map(|s| s.stats()).collect(),
        }
    }
}

fn shard_key(symbol: &str, base: Interval) -> ShardKey {
    (symbol.to_uppercase(), base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn make_engine(dir: &std::path::Path) -> DataEngine {
        let cfg = Arc::new(EngineConfig {
            data_dir: dir.to_path_buf(),
            // Point at an unroutable address so accidental network calls fail fast
            rest_base_url: "http://127.0.0.1:9".to_string(),
            ws_base_url: "ws://127.0.0.1:9".to_string(),
            ..EngineConfig::default()
        });
        let store = Arc::new(CandleStore::new(dir));
        let rest = Arc::new(RestClient::new(&cfg));
        DataEngine::new(cfg, store, rest)
    }

    #[tokio::test]
    async fn test_subscribe_creates_base_shard() {
        let dir = tempfile::tempdir().unwrap();
        let engine = make_engine(dir.path());

        engine.subscribe(Uuid::new_v4(), "BTCUSDT", Interval::M2, Arc::new(|_| {}));

        // 2m resolves to a 1m base shard
        assert!(engine.shard("BTCUSDT", Interval::M1).is_some());
        assert!(engine.shard("BTCUSDT", Interval::M2).is_none());
        assert_eq!(engine.stats().shard_count, 1);
    }

    #[tokio::test]
    async fn test_shards_are_shared_across_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let engine = make_engine(dir.path());

        engine.subscribe(Uuid::new_v4(), "BTCUSDT", Interval::M10, Arc::new(|_| {}));
        engine.subscribe(Uuid::new_v4(), "BTCUSDT", Interval::M20, Arc::new(|_| {}));

        // Both 10m and 20m derive from the same 5m base shard
        assert_eq!(engine.stats().shard_count, 1);
        let shard = engine.shard("BTCUSDT", Interval::M5).unwrap();
        assert_eq!(shard.stats().subscriber_count, 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_schedules_destroy_for_idle_shard() {
        let dir = tempfile::tempdir().unwrap();
        let engine = make_engine(dir.path());
        let strategy = Uuid::new_v4();

        engine.subscribe(strategy, "BTCUSDT", Interval::M1, Arc::new(|_| {}));
        engine.unsubscribe(strategy, "BTCUSDT", Interval::M1);

        let shard = engine.shard("BTCUSDT", Interval::M1).unwrap();
        assert!(shard.is_idle());
        assert!(shard.stats().destroy_pending);
    }

    #[tokio::test]
    async fn test_ensure_active_prewarms_all_bases() {
        let dir = tempfile::tempdir().unwrap();
        let engine = make_engine(dir.path());

        engine.ensure_active("ETHUSDT");

        // 15 native bases serve all 23 targets
        assert_eq!(engine.stats().shard_count, 15);
        let shard = engine.shard("ETHUSDT", Interval::M5).unwrap();
        assert!(!shard.is_idle());

        // Pre-warmed shards ignore destroy scheduling entirely
        engine.unsubscribe(Uuid::new_v4(), "ETHUSDT", Interval::M5);
        assert!(!shard.stats().destroy_pending);
    }

    #[tokio::test]
    async fn test_shutdown_destroys_everything() {
        let dir = tempfile::tempdir().unwrap();
        let engine = make_engine(dir.path());
        engine.subscribe(Uuid::new_v4(), "BTCUSDT", Interval::M1, Arc::new(|_| {}));

        engine.shutdown();
        assert_eq!(engine.stats().shard_count, 0);
    }
}
