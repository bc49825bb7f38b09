//! Discord webhook notifications for fills and halted pairs

use crate::types::{PairKey, PendingOrder};
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tracing::{error, info};

/// Discord webhook client for trade alerts
#[derive(Clone)]
pub struct DiscordWebhook {
    client: Client,
    webhook_url: String,
}

impl DiscordWebhook {
    pub fn new(webhook_url: String) -> Self {
        Self {
            client: Client::new(),
            webhook_url,
        }
    }

    /// A staged order was confirmed by the exchange
    pub async fn send_fill_alert(&self, key: &PairKey, order: &PendingOrder, order_id: &str, price: Decimal) {
        self.post(fill_embed(key, order, order_id, price), &format!("fill on {}", key)).await;
    }

    /// A pair stopped trading and needs manual intervention
    pub async fn send_halt_alert(&self, key: &PairKey, reason: &str) {
        self.post(halt_embed(key, reason), &format!("halt of {}", key)).await;
    }

    async fn post(&self, payload: Value, what: &str) {
        match self.client.post(&self.webhook_url).json(&payload).send().await {
            Ok(response) => {
                if response.status().is_success() {
                    info!("Discord alert sent for {}", what);
                } else {
                    error!("Discord webhook failed: {}", response.status());
                }
            }
            Err(e) => {
                error!("Failed to send Discord webhook: {}", e);
            }
        }
    }
}

fn fill_embed(key: &PairKey, order: &PendingOrder, order_id: &str, price: Decimal) -> Value {
    json!({
        "embeds": [{
            "title": format!("{} {} filled", key.symbol, order.side),
            "color": 0x00FF00,
            "fields": [
                { "name": "Size", "value": order.size.to_string(), "inline": true },
                { "name": "Price", "value": price.normalize().to_string(), "inline": true },
                { "name": "Trigger", "value": order.reason.as_str(), "inline": true },
                { "name": "Order", "value": order_id, "inline": false }
            ],
            "footer": { "text": format!("Trailing stop bot ({} mode)", key.mode) },
            "timestamp": chrono::Utc::now().to_rfc3339()
        }]
    })
}

fn halt_embed(key: &PairKey, reason: &str) -> Value {
    json!({
        "embeds": [{
            "title": format!("{} halted", key),
            "description": reason,
            "color": 0xFF0000,
            "footer": { "text": "Run `resume` after checking the exchange" },
            "timestamp": chrono::Utc::now().to_rfc3339()
        }]
    })
}
