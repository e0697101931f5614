//! Publishing of merged device records.
//!
//! Publishing never blocks uplink processing: the webhook publisher posts
//! from a spawned task and only logs failures.

use serde_json::json;
use tracing::{info, warn};

use vsm_core::DeviceState;

pub trait Publisher: Send + Sync {
    fn publish(&self, device_id: &str, state: &DeviceState);
}

/// Writes each record to the log.
pub struct LogPublisher;

impl Publisher for LogPublisher {
    fn publish(&self, device_id: &str, state: &DeviceState) {
        info!(device = device_id, record = %state.to_value(), "published");
    }
}

/// Fire-and-forget HTTP POST of each record as JSON.
#[derive(Clone)]
pub struct WebhookPublisher {
    url: String,
    client: reqwest::Client,
}

impl WebhookPublisher {
    pub fn new(url: &str) -> Self {
        WebhookPublisher {
            url: url.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

fn envelope(device_id: &str, state: &DeviceState) -> serde_json::Value {
    json!({
        "deviceId": device_id,
        "data": state,
    })
}

impl Publisher for WebhookPublisher {
    fn publish(&self, device_id: &str, state: &DeviceState) {
        let payload = envelope(device_id, state);
        let client = self.client.clone();
        let url = self.url.clone();
        let device = device_id.to_string();

        tokio::spawn(async move {
            match client.post(&url).json(&payload).send().await {
                Ok(r) if !r.status().is_success() => {
                    warn!(device = %device, status = %r.status(), "webhook publish rejected")
                }
                Ok(_) => {}
                Err(e) => warn!(device = %device, error = %e, "webhook publish failed"),
            }
        });
    }
}
