// Core Module - Foundational types, config and logging

pub mod config;
pub mod logger;
pub mod types;

// Re-export commonly used items for convenience
pub use config::{ConfigError, EngineConfig, StrategyConfig, TpslLevel};
pub use logger::setup_logging;
pub use types::{
    format_quantity, now_ms, parse_width_ms, utc_day, Candle, Direction, Interval, OrderAction,
    PositionLabel, PositionState, TradeOrder, TradeStats, QTY_EPSILON,
};
