// REST Client for the exchange kline endpoint
// Rate-limited HTTP client with bounded retries; failures surface as empty results

use reqwest::Client;
use serde_json::Value;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::config::EngineConfig;
use crate::core::types::{Candle, Interval};

#[derive(Debug, Error)]
pub enum RestError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("Max retries exceeded")]
    MaxRetries,
}

// ============================================================================
// Rate Limiter
// ============================================================================

/// Token bucket rate limiter for API requests.
/// Used behind a Mutex, so no internal lock needed.
pub struct RateLimiter {
    tokens: f64,
    max_tokens: f64,
    rate_per_sec: f64,
    last_update: f64,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        let rpm = requests_per_minute as f64;
        Self {
            tokens: rpm,
            max_tokens: rpm,
            rate_per_sec: rpm / 60.0,
            last_update: now_secs(),
        }
    }

    /// Wait until a token is available (caller must hold the Mutex).
    pub async fn acquire(&mut self) {
        loop {
            self.add_tokens();
            if self.tokens >= 1.0 {
                self.tokens -= 1.0;
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    fn add_tokens(&mut self) {
        let now = now_secs();
        let elapsed = now - self.last_update;
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.max_tokens);
        self.last_update = now;
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

// ============================================================================
// Client Statistics
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct RestClientStats {
    pub requests_sent: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub retries: u64,
}

impl fmt::Display for RestClientStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RestClientStats(sent={}, ok={}, fail={}, retries={})",
            self.requests_sent, self.requests_succeeded, self.requests_failed, self.retries
        )
    }
}

// ============================================================================
// Kline REST Client
// ============================================================================

const MAX_ATTEMPTS: u32 = 3;

/// REST client for historical candle pages.
///
/// Errors never propagate to callers: a failed or malformed fetch yields an
/// empty vector and is recorded in the stats. The engine falls back to
/// whatever history it already holds.
pub struct RestClient {
    base_url: String,
    client: Client,
    limiter: Mutex<RateLimiter>,
    stats: parking_lot::Mutex<RestClientStats>,
}

impl RestClient {
    pub fn new(cfg: &EngineConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client with static options");
        Self {
            base_url: cfg.rest_base_url.clone(),
            client,
            limiter: Mutex::new(RateLimiter::new(cfg.requests_per_minute)),
            stats: parking_lot::Mutex::new(RestClientStats::default()),
        }
    }

    /// Fetch up to `limit` candles in the half-open window `[start_ms, end_ms)`.
    /// Every returned candle is tagged with the requested symbol and marked
    /// closed. A non-array body or a transport failure yields an empty vector.
    pub async fn fetch_klines(
        &self,
        symbol: &str,
        interval: Interval,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: usize,
    ) -> Vec<Candle> {
        self.limiter.lock().await.acquire().await;

        let mut url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            symbol.to_uppercase(),
            interval.code(),
            limit
        );
        if let Some(start) = start_ms {
            url.push_str(&format!("&startTime={}", start));
        }
        if let Some(end) = end_ms {
            // Upstream treats endTime inclusively; keep the window half-open.
            url.push_str(&format!("&endTime={}", end - 1));
        }

        match self.get_with_retry(&url).await {
            Ok(body) => {
                let candles = parse_kline_rows(symbol, &body);
                debug!(
                    symbol = symbol,
                    interval = %interval,
                    count = candles.len(),
                    "Fetched historical candles"
                );
                self.stats.lock().requests_succeeded += 1;
                candles
            }
            Err(e) => {
                warn!(symbol = symbol, interval = %interval, error = %e, "Historical fetch failed");
                self.stats.lock().requests_failed += 1;
                Vec::new()
            }
        }
    }

    async fn get_with_retry(&self, url: &str) -> Result<Value, RestError> {
        let mut last_err = RestError::MaxRetries;
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                self.stats.lock().retries += 1;
                tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
            }
            self.stats.lock().requests_sent += 1;

            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.json::<Value>().await?);
                    }
                    let body = resp.text().await.unwrap_or_default();
                    last_err = RestError::Api {
                        status: status.as_u16(),
                        body,
                    };
                }
                Err(e) => last_err = RestError::Http(e),
            }
        }
        Err(last_err)
    }

    pub fn stats(&self) -> RestClientStats {
        self.stats.lock().clone()
    }
}

/// Decode the exchange's kline response: an array of 12-tuples where fields
/// 0-5 are open time, open, high, low, close, volume. Anything else yields
/// an empty result.
pub fn parse_kline_rows(symbol: &str, body: &Value) -> Vec<Candle> {
    let rows = match body.as_array() {
        Some(rows) => rows,
        None => return Vec::new(),
    };

    let mut candles = Vec::with_capacity(rows.len());
    for row in rows {
        let fields = match row.as_array() {
            Some(f) if f.len() >= 6 => f,
            _ => continue,
        };
        let open_time = match fields[0].as_i64() {
            Some(t) => t,
            None => continue,
        };
        let nums: Option<Vec<f64>> = fields[1..6].iter().map(value_as_f64).collect();
        let nums = match nums {
            Some(n) => n,
            None => continue,
        };
        candles.push(Candle::new(
            symbol.to_uppercase(),
            open_time,
            nums[0],
            nums[1],
            nums[2],
            nums[3],
            nums[4],
            true,
        ));
    }
    candles
}

/// The exchange serializes prices as strings; tolerate raw numbers too.
fn value_as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}
