// Live Kline Message Parser
// Decodes exchange push frames into candles; malformed input yields None

use serde::Deserialize;
use std::fmt;
use tracing::debug;

use crate::core::types::Candle;

// ============================================================================
// Raw exchange JSON
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawKlineFrame {
    e: String,
    s: String,
    k: RawKline,
}

#[derive(Debug, Deserialize)]
struct RawKline {
    t: i64,
    o: String,
    h: String,
    l: String,
    c: String,
    v: String,
    x: bool,
}

/// Combined-stream envelope: `{"stream": ..., "data": {...}}`.
#[derive(Debug, Deserialize)]
struct CombinedFrame {
    data: RawKlineFrame,
}

// ============================================================================
// Parser
// ============================================================================

/// Decode one push message of kind "kline" into a `Candle`. Accepts both the
/// combined-stream envelope and a bare event frame; anything else (including
/// subscription acks) is `None`.
pub fn parse_live(msg: &str) -> Option<Candle> {
    let frame = serde_json::from_str::<CombinedFrame>(msg)
        .map(|c| c.data)
        .or_else(|_| serde_json::from_str::<RawKlineFrame>(msg))
        .ok()?;

    if frame.e != "kline" {
        return None;
    }

    let k = frame.k;
    Some(Candle::new(
        frame.s,
        k.t,
        k.o.parse::<f64>().ok()?,
        k.h.parse::<f64>().ok()?,
        k.l.parse::<f64>().ok()?,
        k.c.parse::<f64>().ok()?,
        k.v.parse::<f64>().ok()?,
        k.x,
    ))
}

/// Stateful wrapper that counts accepted and rejected frames for a shard's
/// stats surface.
#[derive(Debug, Default)]
pub struct LiveParser {
    parsed: u64,
    rejected: u64,
}

impl LiveParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(&mut self, msg: &str) -> Option<Candle> {
        match parse_live(msg) {
            Some(candle) => {
                self.parsed += 1;
                Some(candle)
            }
            None => {
                self.rejected += 1;
                debug!(len = msg.len(), "Rejected non-kline frame");
                None
            }
        }
    }

    pub fn parsed(&self) -> u64 {
        self.parsed
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }
}

impl fmt::Display for LiveParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LiveParser(parsed={}, rejected={})", self.parsed, self.rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kline_json(symbol: &str, open_time: i64, close: f64, closed: bool) -> String {
        format!(
            r#"{{"e":"kline","E":{et},"s":"{sym}","k":{{"t":{t},"T":{ct},"s":"{sym}","i":"1m","o":"100.0","c":"{c}","h":"101.0","l":"99.0","v":"12.5","x":{x}}}}}"#,
            et = open_time + 30_000,
            sym = symbol,
            t = open_time,
            ct = open_time + 59_999,
            c = close,
            x = closed,
        )
    }

    #[test]
    fn test_parse_bare_frame() {
        let msg = kline_json("BTCUSDT", 1_700_000_000_000, 100.5, true);
        let candle = parse_live(&msg).unwrap();
        assert_eq!(candle.symbol, "BTCUSDT");
        assert_eq!(candle.open_time, 1_700_000_000_000);
        assert_eq!(candle.open, 100.0);
        assert_eq!(candle.high, 101.0);
        assert_eq!(candle.low, 99.0);
        assert_eq!(candle.close, 100.5);
        assert_eq!(candle.volume, 12.5);
        assert!(candle.is_closed);
    }

    #[test]
    fn test_parse_combined_frame() {
        let inner = kline_json("ETHUSDT", 1_700_000_060_000, 2000.25, false);
        let msg = format!(r#"{{"stream":"ethusdt@kline_1m","data":{}}}"#, inner);
        let candle = parse_live(&msg).unwrap();
        assert_eq!(candle.symbol, "ETHUSDT");
        assert!(!candle.is_closed);
    }

    #[test]
    fn test_parse_rejects_other_events() {
        let msg = r#"{"e":"aggTrade","E":1,"s":"BTCUSDT","p":"100","q":"1"}"#;
        assert!(parse_live(msg).is_none());
    }

    #[test]
    fn test_parse_rejects_subscription_ack() {
        assert!(parse_live(r#"{"result":null,"id":1}"#).is_none());
    }

    #[test]
    fn test_parse_rejects_malformed_price() {
        let msg = r#"{"e":"kline","s":"BTCUSDT","k":{"t":1,"o":"oops","h":"1","l":"1","c":"1","v":"1","x":true}}"#;
        assert!(parse_live(msg).is_none());
    }

    #[test]
    fn test_live_parser_counts() {
        let mut parser = LiveParser::new();
        assert!(parser.parse(&kline_json("BTCUSDT", 0, 1.0, true)).is_some());
        assert!(parser.parse("not json").is_none());
        assert_eq!(parser.parsed(), 1);
        assert_eq!(parser.rejected(), 1);
    }
}
