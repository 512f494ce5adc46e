//! TickForge: a multi-tenant live trading signal engine for crypto futures.
//!
//! The engine ingests candle streams from the exchange, multiplexes one
//! upstream subscription per (symbol, base interval) across many strategy
//! subscribers, synthesizes non-native timeframes by resampling, computes
//! EMA/MACD indicators and runs user-configured strategies whose decisions
//! go out as webhook orders.
//!
//! Layering, bottom up:
//! - [`core`]: candle/interval/position types, configuration, logging.
//! - [`layer1`]: exchange connectivity (REST klines, kline WebSocket).
//! - [`layer2`]: the data plane: parser, candle store, resampler, stream
//!   shards and the shard registry.
//! - [`layer3`]: the strategy plane: indicator kernel, the pure evaluation
//!   core, strategy runtimes, webhook dispatch and the supervisor.

pub mod core;
pub mod layer1;
pub mod layer2;
pub mod layer3;
