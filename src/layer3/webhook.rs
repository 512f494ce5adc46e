// Webhook Dispatcher - Fire-and-forget order notifications
// Single worker drains a queue so per-strategy emission order is preserved

use reqwest::Client;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::core::types::TradeOrder;

#[derive(Debug, Clone, Default)]
pub struct DispatcherStats {
    pub posted: u64,
    pub failed: u64,
}

impl fmt::Display for DispatcherStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dispatcher(posted={}, failed={})", self.posted, self.failed)
    }
}

struct Job {
    urls: Vec<String>,
    order: TradeOrder,
}

/// Posts order payloads as JSON to each configured URL. Fire-and-forget:
/// short timeout, failures logged, never retried. Jobs are drained by one
/// worker so orders go out in emission order.
pub struct WebhookDispatcher {
    tx: mpsc::UnboundedSender<Job>,
    stats: Arc<parking_lot::Mutex<DispatcherStats>>,
}

impl WebhookDispatcher {
    pub fn new(timeout_secs: u64) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let stats = Arc::new(parking_lot::Mutex::new(DispatcherStats::default()));
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .build()
            .expect("reqwest client with static options");

        let worker_stats = Arc::clone(&stats);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                for url in &job.urls {
                    match client.post(url).json(&job.order).send().await {
                        Ok(resp) if resp.status().is_success() => {
                            worker_stats.lock().posted += 1;
                            debug!(url = %url, order = %job.order, "Webhook delivered");
                        }
                        Ok(resp) => {
                            worker_stats.lock().failed += 1;
                            warn!(url = %url, status = %resp.status(), "Webhook rejected");
                        }
                        Err(e) => {
                            worker_stats.lock().failed += 1;
                            warn!(url = %url, error = %e, "Webhook failed");
                        }
                    }
                }
            }
        });

        Self { tx, stats }
    }

    /// Enqueue one order for delivery to every URL. Never blocks.
    pub fn dispatch(&self, urls: &[String], order: &TradeOrder) {
        if urls.is_empty() {
            debug!(order = %order, "No webhook URLs configured, order not sent");
            return;
        }
        let _ = self.tx.send(Job {
            urls: urls.to_vec(),
            order: order.clone(),
        });
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{OrderAction, PositionLabel};

    fn sample_order() -> TradeOrder {
        TradeOrder {
            action: OrderAction::Buy,
            position: PositionLabel::Long,
            symbol: "BTCUSDT".to_string(),
            quantity: "2".to_string(),
            trade_amount: 100.0,
            leverage: 5,
            timestamp: 0,
            tv_exchange: "BINANCE".to_string(),
            strategy_name: "test".to_string(),
            tp_level: "test".to_string(),
            execution_price: 50.0,
            execution_quantity: 2.0,
        }
    }

    #[tokio::test]
    async fn test_dispatch_without_urls_is_a_no_op() {
        let dispatcher = WebhookDispatcher::new(1);
        dispatcher.dispatch(&[], &sample_order());
        let stats = dispatcher.stats();
        assert_eq!(stats.posted, 0);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn test_dispatch_failure_is_swallowed() {
        let dispatcher = WebhookDispatcher::new(1);
        // Nothing listens here; the POST fails and is only counted
        dispatcher.dispatch(&["http://127.0.0.1:1/webhook".to_string()], &sample_order());
        tokio::time::sleep(Duration::from_millis(300)).await;
        let stats = dispatcher.stats();
        assert_eq!(stats.posted, 0);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn test_order_payload_shape() {
        let order = sample_order();
        let json = serde_json::to_value(&order).unwrap();
        assert_eq!(json["action"], "buy");
        assert_eq!(json["position"], "long");
        assert_eq!(json["quantity"], "2");
        assert_eq!(json["leverage"], 5);
        assert_eq!(json["execution_price"], 50.0);
    }
}
