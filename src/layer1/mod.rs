// Layer 1 - Exchange Connectivity
// REST history pages and the live kline WebSocket

pub mod rest_client;
pub mod websocket;

// Re-export commonly used items for convenience
pub use rest_client::{parse_kline_rows, RateLimiter, RestClient, RestClientStats, RestError};
pub use websocket::{backoff_delay, kline_stream_name, KlineSocket, SocketClose, WsError};
