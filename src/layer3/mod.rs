// Layer 3 - Strategy Plane
// Indicators, the evaluation core, per-strategy runtimes and their host

pub mod evaluator;
pub mod indicators;
pub mod strategy;
pub mod supervisor;
pub mod webhook;

// Re-export commonly used items
pub use evaluator::{detect_signals, evaluate, EvalOutcome, SignalKind, SignalSet};
pub use indicators::{ema_series, enrich};
pub use strategy::{StrategyEvent, StrategyRuntime, StrategySnapshot, StrategyStats};
pub use supervisor::{OrderLogEntry, Supervisor};
pub use webhook::{DispatcherStats, WebhookDispatcher};
