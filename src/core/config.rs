// Configuration Management for TickForge
// Engine-level settings plus per-strategy user parameters

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::core::types::{Direction, Interval};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Engine Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub rest_base_url: String,
    pub ws_base_url: String,
    pub data_dir: PathBuf,

    // Shard lifecycle
    pub reconnect_delay_secs: u64,
    pub destroy_delay_secs: u64,
    pub persist_throttle_secs: u64,

    // Buffer caps
    pub base_buffer_cap: usize,
    pub derived_buffer_cap: usize,

    // Historical fetch
    pub history_page_limit: usize,
    pub deep_fetch_pages: usize,
    pub requests_per_minute: u32,

    // WebSocket keep-alive
    pub ws_ping_interval_secs: u64,
    pub ws_stale_timeout_secs: u64,

    // Supervisor
    pub supervisor_persist_secs: u64,
    pub prewarm_symbols: Vec<String>,

    // Outbound webhooks
    pub webhook_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rest_base_url: "https://fapi.binance.com".to_string(),
            ws_base_url: "wss://fstream.binance.com".to_string(),
            data_dir: PathBuf::from("data"),
            reconnect_delay_secs: 5,
            destroy_delay_secs: 60,
            persist_throttle_secs: 60,
            base_buffer_cap: 5000,
            derived_buffer_cap: 1000,
            history_page_limit: 1500,
            deep_fetch_pages: 3,
            requests_per_minute: 1200,
            ws_ping_interval_secs: 20,
            ws_stale_timeout_secs: 60,
            supervisor_persist_secs: 5,
            prewarm_symbols: Vec::new(),
            webhook_timeout_secs: 5,
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file; missing file falls back to defaults, a
    /// malformed file is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!(path = %path.display(), "Config file absent, using defaults");
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        let cfg: EngineConfig = serde_json::from_str(&raw)?;
        info!(path = %path.display(), "Engine config loaded");
        Ok(cfg)
    }
}

// ============================================================================
// Strategy Configuration
// ============================================================================

/// One rung of a multi-level take-profit or stop-loss ladder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TpslLevel {
    pub active: bool,
    /// Distance from entry, percent.
    pub pct: f64,
    /// Share of the initial quantity to close at this rung, percent.
    pub qty_pct: f64,
}

impl Default for TpslLevel {
    fn default() -> Self {
        Self {
            active: false,
            pct: 1.0,
            qty_pct: 25.0,
        }
    }
}

/// Immutable snapshot of the user parameters for one strategy. Replaced as a
/// whole by `update_config`; never mutated in place during evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub id: String,
    pub name: String,
    pub symbol: String,
    pub interval: Interval,
    pub is_active: bool,
    pub trade_amount: f64,
    pub leverage: u32,
    pub tv_exchange: String,
    pub webhook_urls: Vec<String>,

    /// On-close vs intraday triggering for EMA/MACD signals.
    pub trigger_on_close: bool,

    // Trend filter
    pub trend_filter_block_long: bool,
    pub trend_filter_block_short: bool,

    // Cross signals: enable plus per-direction enables
    pub use_ema7_25: bool,
    pub ema7_25_long: bool,
    pub ema7_25_short: bool,
    pub use_ema7_99: bool,
    pub ema7_99_long: bool,
    pub ema7_99_short: bool,
    pub use_ema25_99: bool,
    pub ema25_99_long: bool,
    pub ema25_99_short: bool,
    pub use_ema_double: bool,
    pub ema_double_long: bool,
    pub ema_double_short: bool,
    pub use_macd: bool,
    pub macd_long: bool,
    pub macd_short: bool,

    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,

    // Fixed TP/SL
    pub use_fixed_tpsl: bool,
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,

    // Trailing stop
    pub use_trailing_stop: bool,
    pub trailing_activation_pct: f64,
    pub trailing_distance_pct: f64,

    // Multi-level ladders
    pub use_multi_tpsl: bool,
    pub tp_levels: Vec<TpslLevel>,
    pub sl_levels: Vec<TpslLevel>,

    // Reversal on signal exit
    pub use_reverse: bool,
    pub reverse_long_to_short: bool,
    pub reverse_short_to_long: bool,

    pub max_daily_trades: u32,

    // Deferred pullback-to-EMA7 entry
    pub use_reversion_entry: bool,
    pub reversion_pct: f64,

    // Manual takeover
    pub manual_takeover: bool,
    pub takeover_direction: Direction,
    pub takeover_quantity: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: "strategy".to_string(),
            symbol: "BTCUSDT".to_string(),
            interval: Interval::M15,
            is_active: false,
            trade_amount: 100.0,
            leverage: 5,
            tv_exchange: "BINANCE".to_string(),
            webhook_urls: Vec::new(),
            trigger_on_close: true,
            trend_filter_block_long: false,
            trend_filter_block_short: false,
            use_ema7_25: false,
            ema7_25_long: true,
            ema7_25_short: true,
            use_ema7_99: false,
            ema7_99_long: true,
            ema7_99_short: true,
            use_ema25_99: false,
            ema25_99_long: true,
            ema25_99_short: true,
            use_ema_double: false,
            ema_double_long: true,
            ema_double_short: true,
            use_macd: false,
            macd_long: true,
            macd_short: true,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            use_fixed_tpsl: false,
            take_profit_pct: 2.0,
            stop_loss_pct: 2.0,
            use_trailing_stop: false,
            trailing_activation_pct: 1.0,
            trailing_distance_pct: 0.5,
            use_multi_tpsl: false,
            tp_levels: Vec::new(),
            sl_levels: Vec::new(),
            use_reverse: false,
            reverse_long_to_short: true,
            reverse_short_to_long: true,
            max_daily_trades: 10,
            use_reversion_entry: false,
            reversion_pct: 0.0,
            manual_takeover: false,
            takeover_direction: Direction::Flat,
            takeover_quantity: 0.0,
        }
    }
}

impl StrategyConfig {
    /// Shallow-merge a persisted snapshot over the defaults so fields added
    /// after the snapshot was written take safe default values.
    pub fn merge_snapshot(snapshot: &serde_json::Value) -> Result<Self, ConfigError> {
        let mut merged = serde_json::to_value(StrategyConfig::default())?;
        if let (Some(base), Some(patch)) = (merged.as_object_mut(), snapshot.as_object()) {
            for (key, value) in patch {
                base.insert(key.clone(), value.clone());
            }
        } else {
            warn!("Strategy snapshot is not a JSON object, using defaults");
        }
        Ok(serde_json::from_value(merged)?)
    }

    /// Apply a partial update (JSON object of changed fields) over this
    /// config, returning the replacement.
    pub fn apply_partial(&self, partial: &serde_json::Value) -> Result<Self, ConfigError> {
        let mut merged = serde_json::to_value(self)?;
        if let (Some(base), Some(patch)) = (merged.as_object_mut(), partial.as_object()) {
            for (key, value) in patch {
                base.insert(key.clone(), value.clone());
            }
        }
        Ok(serde_json::from_value(merged)?)
    }
}
