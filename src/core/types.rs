// Core Type Definitions for TickForge
// Candles, intervals, positions, trade stats and outbound orders

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Quantity below which a position is considered fully closed.
pub const QTY_EPSILON: f64 = 1e-6;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// UTC calendar date (YYYY-MM-DD) for an epoch-millisecond timestamp.
/// Used as the daily-trade-cap key; always UTC, never the operator's local day.
pub fn utc_day(ms: i64) -> String {
    use chrono::{TimeZone, Utc};
    match Utc.timestamp_millis_opt(ms).single() {
        Some(dt) => dt.format("%Y-%m-%d").to_string(),
        None => "1970-01-01".to_string(),
    }
}

// ============================================================================
// Interval
// ============================================================================

/// Candle interval code. Closed set of 23 values the engine understands;
/// 15 are native to the exchange, 8 are synthesized by resampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "2m")]
    M2,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "6m")]
    M6,
    #[serde(rename = "10m")]
    M10,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "20m")]
    M20,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "45m")]
    M45,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "3h")]
    H3,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "6h")]
    H6,
    #[serde(rename = "8h")]
    H8,
    #[serde(rename = "10h")]
    H10,
    #[serde(rename = "12h")]
    H12,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "2d")]
    D2,
    #[serde(rename = "3d")]
    D3,
    #[serde(rename = "1w")]
    W1,
    #[serde(rename = "1M")]
    Mo1,
}

impl Interval {
    /// All supported intervals, smallest to largest.
    pub const ALL: [Interval; 23] = [
        Interval::M1,
        Interval::M2,
        Interval::M3,
        Interval::M5,
        Interval::M6,
        Interval::M10,
        Interval::M15,
        Interval::M20,
        Interval::M30,
        Interval::M45,
        Interval::H1,
        Interval::H2,
        Interval::H3,
        Interval::H4,
        Interval::H6,
        Interval::H8,
        Interval::H10,
        Interval::H12,
        Interval::D1,
        Interval::D2,
        Interval::D3,
        Interval::W1,
        Interval::Mo1,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            Interval::M1 => "1m",
            Interval::M2 => "2m",
            Interval::M3 => "3m",
            Interval::M5 => "5m",
            Interval::M6 => "6m",
            Interval::M10 => "10m",
            Interval::M15 => "15m",
            Interval::M20 => "20m",
            Interval::M30 => "30m",
            Interval::M45 => "45m",
            Interval::H1 => "1h",
            Interval::H2 => "2h",
            Interval::H3 => "3h",
            Interval::H4 => "4h",
            Interval::H6 => "6h",
            Interval::H8 => "8h",
            Interval::H10 => "10h",
            Interval::H12 => "12h",
            Interval::D1 => "1d",
            Interval::D2 => "2d",
            Interval::D3 => "3d",
            Interval::W1 => "1w",
            Interval::Mo1 => "1M",
        }
    }

    pub fn from_code(code: &str) -> Option<Interval> {
        Interval::ALL.iter().copied().find(|i| i.code() == code)
    }

    /// Millisecond width of the interval.
    pub fn width_ms(&self) -> i64 {
        parse_width_ms(self.code())
    }

    /// True when the exchange streams this interval directly.
    pub fn is_native(&self) -> bool {
        !matches!(
            self,
            Interval::M2
                | Interval::M6
                | Interval::M10
                | Interval::M20
                | Interval::M45
                | Interval::H3
                | Interval::H10
                | Interval::D2
        )
    }

    /// Base interval a shard subscribes to in order to serve this target.
    /// Native intervals are their own base; the 8 synthesized intervals map
    /// to their largest divisor native base.
    pub fn base(&self) -> Interval {
        match self {
            Interval::M2 => Interval::M1,
            Interval::M6 => Interval::M3,
            Interval::M10 => Interval::M5,
            Interval::M20 => Interval::M5,
            Interval::M45 => Interval::M15,
            Interval::H3 => Interval::H1,
            Interval::H10 => Interval::H2,
            Interval::D2 => Interval::D1,
            native => *native,
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl std::str::FromStr for Interval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Interval::from_code(s).ok_or_else(|| format!("unknown interval code '{}'", s))
    }
}

/// Millisecond width from an interval code: numeric prefix times unit factor.
/// Unparsable input falls back to one minute.
pub fn parse_width_ms(code: &str) -> i64 {
    let default = 60_000;
    if code.is_empty() {
        return default;
    }
    let (digits, unit) = code.split_at(code.len() - 1);
    let n: i64 = match digits.parse() {
        Ok(n) => n,
        Err(_) => return default,
    };
    let factor = match unit {
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        "w" => 604_800_000,
        "M" => 2_592_000_000,
        _ => return default,
    };
    n * factor
}

// ============================================================================
// Candle
// ============================================================================

/// One OHLCV candle, optionally enriched with indicator values.
///
/// Within a (symbol, interval) series candles are strictly ordered by
/// `open_time` and spaced by the interval width. A closed candle is
/// immutable; the open candle at the tail may be overwritten by newer ticks
/// carrying the same `open_time`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_closed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ema7: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ema25: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ema99: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub macd_line: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub macd_signal: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub macd_hist: Option<f64>,
}

impl Candle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: impl Into<String>,
        open_time: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        is_closed: bool,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            open_time,
            open,
            high,
            low,
            close,
            volume,
            is_closed,
            ..Default::default()
        }
    }
}

impl fmt::Display for Candle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Candle(symbol={}, t={}, O={:.2}, H={:.2}, L={:.2}, C={:.2}, closed={})",
            self.symbol, self.open_time, self.open, self.high, self.low, self.close, self.is_closed
        )
    }
}

// ============================================================================
// Direction / Position / Stats
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Flat,
    Long,
    Short,
}

impl Direction {
    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Flat => Direction::Flat,
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Live position for one strategy.
///
/// Invariants: FLAT implies all quantities and prices are zero and the
/// level-hit lists are empty; `0 <= remaining_qty <= initial_qty`;
/// `highest_price >= entry_price` when LONG and `lowest_price <= entry_price`
/// when SHORT.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionState {
    pub direction: Direction,
    pub initial_qty: f64,
    pub remaining_qty: f64,
    pub entry_price: f64,
    pub highest_price: f64,
    pub lowest_price: f64,
    pub open_time: i64,
    pub tp_levels_hit: Vec<usize>,
    pub sl_levels_hit: Vec<usize>,
    pub pending_reversion: Option<Direction>,
    pub pending_reversion_reason: Option<String>,
}

impl PositionState {
    pub fn flat() -> Self {
        Self::default()
    }

    pub fn is_flat(&self) -> bool {
        self.direction == Direction::Flat
    }

    /// Open a fresh position. Extremes seed from the entry price; the
    /// reverse-open path overrides them with the candle extremes afterwards.
    pub fn open(direction: Direction, qty: f64, entry_price: f64, open_time: i64) -> Self {
        Self {
            direction,
            initial_qty: qty,
            remaining_qty: qty,
            entry_price,
            highest_price: entry_price,
            lowest_price: entry_price,
            open_time,
            ..Default::default()
        }
    }
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Position({:?}, qty={:.6}/{:.6}, entry={:.2})",
            self.direction, self.remaining_qty, self.initial_qty, self.entry_price
        )
    }
}

/// Rolling daily trade counter. The count resets whenever the current UTC
/// date differs from `last_trade_date`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeStats {
    pub daily_trade_count: u32,
    pub last_trade_date: String,
}

impl TradeStats {
    pub fn roll_over(&mut self, today: &str) {
        if self.last_trade_date != today {
            self.daily_trade_count = 0;
            self.last_trade_date = today.to_string();
        }
    }
}

// ============================================================================
// Outbound orders
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderAction {
    Buy,
    Sell,
}

impl fmt::Display for OrderAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderAction::Buy => write!(f, "buy"),
            OrderAction::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionLabel {
    Long,
    Short,
    Flat,
}

impl fmt::Display for PositionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionLabel::Long => write!(f, "long"),
            PositionLabel::Short => write!(f, "short"),
            PositionLabel::Flat => write!(f, "flat"),
        }
    }
}

/// Webhook order payload. Open-long is buy/long, open-short is sell/short;
/// closing a long sells and closing a short buys, labelled with the
/// remaining direction for partial closes or `flat` for full closes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOrder {
    pub action: OrderAction,
    pub position: PositionLabel,
    pub symbol: String,
    pub quantity: String,
    pub trade_amount: f64,
    pub leverage: u32,
    pub timestamp: i64,
    pub tv_exchange: String,
    pub strategy_name: String,
    pub tp_level: String,
    pub execution_price: f64,
    pub execution_quantity: f64,
}

impl fmt::Display for TradeOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Order({}/{} {} qty={} @ {:.4} [{}])",
            self.action, self.position, self.symbol, self.quantity, self.execution_price, self.tp_level
        )
    }
}

/// Stringified quantity for the webhook payload; whole numbers print without
/// a trailing `.0` so `100 / 50` serializes as `"2"`.
pub fn format_quantity(qty: f64) -> String {
    format!("{}", qty)
}
