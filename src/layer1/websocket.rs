// Kline WebSocket Client
// One connection per stream shard; ping keep-alive, stale detection,
// reconnection policy owned by the caller

use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};

use crate::core::config::EngineConfig;
use crate::core::types::Interval;

#[derive(Debug, Error)]
pub enum WsError {
    #[error("WebSocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Subscriber channel closed")]
    ChannelClosed,
}

/// Why a healthy connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketClose {
    /// Server sent a close frame.
    ServerClosed,
    /// The read stream ended without a close frame.
    StreamEnded,
    /// No frame arrived within the stale timeout.
    Stale,
}

/// Exchange kline stream name, e.g. `btcusdt@kline_1m`.
pub fn kline_stream_name(symbol: &str, interval: Interval) -> String {
    format!("{}@kline_{}", symbol.to_lowercase(), interval.code())
}

/// A single-subscription kline socket. `run_once` drives one connection to
/// completion; the owning shard decides whether to reconnect and sleeps the
/// backoff between attempts.
pub struct KlineSocket {
    url: String,
    stream_name: String,
    ping_interval: Duration,
    stale_timeout: Duration,
    next_request_id: AtomicU32,
}

impl KlineSocket {
    pub fn new(cfg: &EngineConfig, symbol: &str, interval: Interval) -> Self {
        Self {
            url: format!("{}/ws", cfg.ws_base_url),
            stream_name: kline_stream_name(symbol, interval),
            ping_interval: Duration::from_secs(cfg.ws_ping_interval_secs),
            stale_timeout: Duration::from_secs(cfg.ws_stale_timeout_secs),
            next_request_id: AtomicU32::new(1),
        }
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Connect, subscribe and forward raw text frames into `tx` until the
    /// connection ends. Returns how it ended; transport failures bubble as
    /// `WsError` so the caller can apply its backoff either way.
    pub async fn run_once(&self, tx: &mpsc::UnboundedSender<String>) -> Result<SocketClose, WsError> {
        debug!(url = %self.url, stream = %self.stream_name, "Connecting to WebSocket");

        let (ws_stream, _) = connect_async(self.url.as_str()).await?;
        info!(stream = %self.stream_name, "WebSocket connected");

        let (mut write, mut read) = ws_stream.split();

        let req_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let subscribe_msg = serde_json::json!({
            "method": "SUBSCRIBE",
            "params": [self.stream_name],
            "id": req_id
        });
        write.send(Message::Text(subscribe_msg.to_string())).await?;

        let mut ping_tick = tokio::time::interval(self.ping_interval);
        ping_tick.tick().await; // first tick fires immediately, skip it
        let mut stale_tick = tokio::time::interval(Duration::from_secs(5));
        let mut last_frame = Instant::now();

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            last_frame = Instant::now();
                            if tx.send(text).is_err() {
                                return Err(WsError::ChannelClosed);
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            last_frame = Instant::now();
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_frame = Instant::now();
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!(stream = %self.stream_name, "WebSocket closed by server");
                            return Ok(SocketClose::ServerClosed);
                        }
                        Some(Ok(other)) => {
                            debug!(stream = %self.stream_name, frame = ?other, "Ignoring non-text frame");
                        }
                        Some(Err(e)) => {
                            warn!(stream = %self.stream_name, error = %e, "WebSocket error");
                            return Err(WsError::Transport(e));
                        }
                        None => {
                            info!(stream = %self.stream_name, "WebSocket stream ended");
                            return Ok(SocketClose::StreamEnded);
                        }
                    }
                }
                _ = ping_tick.tick() => {
                    if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                        warn!(stream = %self.stream_name, error = %e, "Ping failed");
                        return Err(WsError::Transport(e));
                    }
                }
                _ = stale_tick.tick() => {
                    if last_frame.elapsed() > self.stale_timeout {
                        warn!(stream = %self.stream_name, elapsed = ?last_frame.elapsed(), "Stale connection detected");
                        return Ok(SocketClose::Stale);
                    }
                }
            }
        }
    }
}

/// Reconnect delay: the configured base, escalating as `base * 2^attempt`
/// capped at 60 seconds.
pub fn backoff_delay(base_secs: u64, attempt: u32) -> Duration {
    let secs = base_secs.saturating_mul(2_u64.saturating_pow(attempt)).min(60);
    Duration::from_secs(secs.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kline_stream_name() {
        assert_eq!(kline_stream_name("BTCUSDT", Interval::M1), "btcusdt@kline_1m");
        assert_eq!(kline_stream_name("ethusdt", Interval::H4), "ethusdt@kline_4h");
    }

    #[test]
    fn test_backoff_delay_escalates_and_caps() {
        assert_eq!(backoff_delay(5, 0), Duration::from_secs(5));
        assert_eq!(backoff_delay(5, 1), Duration::from_secs(10));
        assert_eq!(backoff_delay(5, 2), Duration::from_secs(20));
        assert_eq!(backoff_delay(5, 10), Duration::from_secs(60));
        // Zero base still waits a beat
        assert_eq!(backoff_delay(0, 3), Duration::from_secs(1));
    }

    #[test]
    fn test_socket_construction() {
        let cfg = EngineConfig::default();
        let socket = KlineSocket::new(&cfg, "BTCUSDT", Interval::M5);
        assert_eq!(socket.stream_name(), "btcusdt@kline_5m");
    }
}
