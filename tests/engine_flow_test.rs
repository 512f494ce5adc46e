// End-to-End Flow Tests for TickForge
//
// These tests exercise the full data pipeline without network connections:
//   parser -> stream shard -> resampler -> indicators -> evaluation core
//
// Run with: cargo test --test engine_flow_test

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use tickforge::core::config::{EngineConfig, StrategyConfig};
use tickforge::core::types::{Candle, Direction, Interval};
use tickforge::layer1::rest_client::RestClient;
use tickforge::layer2::candle_store::CandleStore;
use tickforge::layer2::data_engine::DataEngine;
use tickforge::layer2::parser::parse_live;
use tickforge::layer2::stream_shard::StreamShard;
use tickforge::layer3::strategy::{StrategyEvent, StrategyRuntime};
use tickforge::layer3::webhook::WebhookDispatcher;

// ============================================================================
// Helpers
// ============================================================================

/// Build a valid kline push frame for the given symbol/minute.
fn make_kline_json(symbol: &str, minute: i64, close: f64, closed: bool) -> String {
    let open_time = minute * 60_000;
    format!(
        r#"{{"e":"kline","E":{et},"s":"{sym}","k":{{"t":{t},"T":{ct},"s":"{sym}","i":"1m","o":"{o}","c":"{c}","h":"{h}","l":"{l}","v":"3.5","x":{x}}}}}"#,
        et = open_time + 30_000,
        sym = symbol,
        t = open_time,
        ct = open_time + 59_999,
        o = close - 0.2,
        c = close,
        h = close + 0.3,
        l = close - 0.4,
        x = closed,
    )
}

fn offline_engine_config(dir: &std::path::Path) -> Arc<EngineConfig> {
    Arc::new(EngineConfig {
        data_dir: dir.to_path_buf(),
        // Unroutable endpoints: any accidental network call fails fast
        rest_base_url: "http://127.0.0.1:9".to_string(),
        ws_base_url: "ws://127.0.0.1:9".to_string(),
        ..EngineConfig::default()
    })
}

fn make_shard(dir: &std::path::Path, cfg: Arc<EngineConfig>) -> Arc<StreamShard> {
    let store = Arc::new(CandleStore::new(dir));
    let rest = Arc::new(RestClient::new(&cfg));
    StreamShard::new("BTCUSDT", Interval::M1, cfg, store, rest)
}

/// Closes that decline gently for 119 minutes then jump: EMA7 crosses above
/// EMA25 on the final candle.
fn cross_closes() -> Vec<f64> {
    let mut closes: Vec<f64> = (0..119).map(|i| 46.0 - 0.01 * i as f64).collect();
    closes.push(50.0);
    closes
}

// ============================================================================
// TEST 1 - Parser feeds the shard; subscribers see resampled views
// ============================================================================

#[tokio::test]
async fn test_parsed_frames_flow_into_resampled_views() {
    let dir = tempfile::tempdir().unwrap();
    let shard = make_shard(dir.path(), offline_engine_config(dir.path()));

    let received: Arc<Mutex<Vec<Vec<Candle>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    shard.subscribe(
        Uuid::new_v4(),
        Interval::M2,
        Arc::new(move |candles| sink.lock().push(candles)),
    );

    for minute in 0..4 {
        let frame = make_kline_json("BTCUSDT", minute, 100.0 + minute as f64, true);
        let candle = parse_live(&frame).expect("valid kline frame");
        shard.apply_tick(candle);
    }

    let batches = received.lock();
    // Immediate snapshot plus one delivery per tick
    assert_eq!(batches.len(), 5);
    let last = batches.last().unwrap();
    assert_eq!(last.len(), 2, "four 1m candles make two 2m buckets");
    assert_eq!(last[0].open_time, 0);
    assert_eq!(last[1].open_time, 2 * 60_000);
    assert!(last[0].is_closed);
    assert!(last[1].is_closed);
    // Aggregated extremes dominate the base candles in each bucket
    assert!(last[0].high >= 101.3);
    assert!(last[0].low <= 99.6);
}

// ============================================================================
// TEST 2 - Open-candle re-delivery keeps the tail mutable
// ============================================================================

#[tokio::test]
async fn test_open_candle_overwrite_preserves_ordering() {
    let dir = tempfile::tempdir().unwrap();
    let shard = make_shard(dir.path(), offline_engine_config(dir.path()));

    let received: Arc<Mutex<Vec<Vec<Candle>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    shard.subscribe(
        Uuid::new_v4(),
        Interval::M1,
        Arc::new(move |candles| sink.lock().push(candles)),
    );

    // Same open time streamed three times, then closed
    for close in [100.0_f64, 100.4, 100.9] {
        let candle = parse_live(&make_kline_json("BTCUSDT", 7, close, false)).unwrap();
        shard.apply_tick(candle);
    }
    let candle = parse_live(&make_kline_json("BTCUSDT", 7, 101.0, true)).unwrap();
    shard.apply_tick(candle);

    assert_eq!(shard.stats().base_len, 1);
    let batches = received.lock();
    let closed_times: Vec<i64> = batches
        .iter()
        .flat_map(|b| b.iter().filter(|c| c.is_closed).map(|c| c.open_time))
        .collect();
    // Closed candles never move backwards in time
    for pair in closed_times.windows(2) {
        assert!(pair[0] <= pair[1]);
    }
    let last = batches.last().unwrap();
    assert_eq!(last[0].close, 101.0);
    assert!(last[0].is_closed);
}

// ============================================================================
// TEST 3 - Buffer cap and strict ordering under load
// ============================================================================

#[tokio::test]
async fn test_base_buffer_cap_and_ordering() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Arc::new(EngineConfig {
        base_buffer_cap: 100,
        ..(*offline_engine_config(dir.path())).clone()
    });
    let shard = make_shard(dir.path(), cfg);

    for minute in 0..150 {
        let candle = parse_live(&make_kline_json("BTCUSDT", minute, 100.0, true)).unwrap();
        shard.apply_tick(candle);
    }

    let stats = shard.stats();
    assert_eq!(stats.base_len, 100, "buffer capped");
    assert_eq!(stats.ticks_processed, 150);

    // The oldest candles were trimmed; the view stays strictly increasing
    let received: Arc<Mutex<Vec<Vec<Candle>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    shard.subscribe(
        Uuid::new_v4(),
        Interval::M1,
        Arc::new(move |candles| sink.lock().push(candles)),
    );
    let batches = received.lock();
    let view = batches.last().unwrap();
    assert_eq!(view[0].open_time, 50 * 60_000);
    for pair in view.windows(2) {
        assert!(pair[0].open_time < pair[1].open_time);
    }
}

// ============================================================================
// TEST 4 - Full path: engine subscription drives a strategy into a position
// ============================================================================

#[tokio::test]
async fn test_engine_ticks_drive_strategy_entry() {
    let dir = tempfile::tempdir().unwrap();
    let engine_cfg = offline_engine_config(dir.path());
    let store = Arc::new(CandleStore::new(dir.path()));
    let rest = Arc::new(RestClient::new(&engine_cfg));
    let engine = DataEngine::new(Arc::clone(&engine_cfg), store, rest);
    let dispatcher = Arc::new(WebhookDispatcher::new(1));
    let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();

    let strategy_cfg = StrategyConfig {
        is_active: true,
        symbol: "BTCUSDT".to_string(),
        interval: Interval::M1,
        use_ema7_25: true,
        trade_amount: 100.0,
        ..StrategyConfig::default()
    };
    let runtime = StrategyRuntime::new(strategy_cfg, engine.clone(), dispatcher, events_tx);
    runtime.start();

    let shard = engine
        .shard("BTCUSDT", Interval::M1)
        .expect("subscription created the base shard");

    for (minute, close) in cross_closes().into_iter().enumerate() {
        let candle = parse_live(&make_kline_json("BTCUSDT", minute as i64, close, true)).unwrap();
        shard.apply_tick(candle);
        // Pace the producer so the strategy's bounded queue never drops the
        // final batch carrying the cross
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    // Batches cross a channel into the strategy task; give it a beat
    tokio::time::sleep(Duration::from_millis(300)).await;

    let snap = runtime.snapshot();
    assert_eq!(snap.position.direction, Direction::Long);
    assert!((snap.position.entry_price - 50.0).abs() < 1e-9);
    assert!((snap.position.remaining_qty - 2.0).abs() < 1e-9);

    // The order made it out through the event channel
    let mut saw_order = false;
    while let Ok(event) = events_rx.try_recv() {
        if let StrategyEvent::OrderEmitted { order, .. } = event {
            assert_eq!(order.quantity, "2");
            assert_eq!(order.tp_level, "EMA7 crosses above 25 open long");
            saw_order = true;
        }
    }
    assert!(saw_order, "entry order emitted");

    runtime.stop();
}

// ============================================================================
// TEST 5 - Foreign-symbol frames never contaminate a strategy
// ============================================================================

#[tokio::test]
async fn test_identity_guard_across_the_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let engine_cfg = offline_engine_config(dir.path());
    let store = Arc::new(CandleStore::new(dir.path()));
    let rest = Arc::new(RestClient::new(&engine_cfg));
    let engine = DataEngine::new(Arc::clone(&engine_cfg), store, rest);
    let dispatcher = Arc::new(WebhookDispatcher::new(1));
    let (events_tx, _events_rx) = tokio::sync::mpsc::unbounded_channel();

    let runtime = StrategyRuntime::new(
        StrategyConfig {
            is_active: true,
            symbol: "BTCUSDT".to_string(),
            interval: Interval::M1,
            use_ema7_25: true,
            ..StrategyConfig::default()
        },
        engine.clone(),
        dispatcher,
        events_tx,
    );

    // A mis-routed batch carrying another symbol is dropped whole
    let foreign: Vec<Candle> = cross_closes()
        .into_iter()
        .enumerate()
        .map(|(i, c)| Candle::new("ETHUSDT", i as i64 * 60_000, c, c, c, c, 1.0, true))
        .collect();
    runtime.process_batch(foreign);

    let snap = runtime.snapshot();
    assert!(snap.position.is_flat());
    assert_eq!(runtime.stats().identity_rejects, 1);
    assert_eq!(runtime.stats().orders_emitted, 0);

    // The shard itself also refuses foreign ticks
    let shard = make_shard(dir.path(), engine_cfg);
    shard.apply_tick(Candle::new("ETHUSDT", 0, 1.0, 1.0, 1.0, 1.0, 1.0, true));
    assert_eq!(shard.stats().base_len, 0);
}

// ============================================================================
// TEST 6 - Shard persistence survives a destroy/recreate cycle
// ============================================================================

#[tokio::test]
async fn test_shard_persists_and_reloads_across_destroy() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = offline_engine_config(dir.path());

    let shard = make_shard(dir.path(), Arc::clone(&cfg));
    for minute in 0..10 {
        let candle = parse_live(&make_kline_json("BTCUSDT", minute, 100.0, true)).unwrap();
        shard.apply_tick(candle);
    }
    shard.destroy();

    let store = CandleStore::new(dir.path());
    let persisted = store.load_candles("BTCUSDT_1m");
    assert_eq!(persisted.len(), 10);
    for pair in persisted.windows(2) {
        assert!(pair[0].open_time < pair[1].open_time);
    }
    assert!(persisted.iter().all(|c| c.symbol == "BTCUSDT"));
}
