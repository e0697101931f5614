//! Downlink delivery to the network server.
//!
//! A [`Downlinker`] accepts one frame for one device. Acceptance means the
//! network server queued it; nothing here knows whether the device got it.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use vsm_core::{Downlink, Result, VsmError};

#[async_trait]
pub trait Downlinker: Send + Sync {
    async fn send(&self, device_id: &str, downlink: &Downlink) -> Result<()>;
}

/// Logs downlinks instead of sending them.
pub struct LogDownlinker;

#[async_trait]
impl Downlinker for LogDownlinker {
    async fn send(&self, device_id: &str, downlink: &Downlink) -> Result<()> {
        info!(
            device = device_id,
            port = downlink.port,
            tag = downlink.tag().map(|t| t.name()),
            payload = %downlink.payload_hex(),
            confirmed = downlink.confirmed,
            "downlink (not sent, no network server configured)"
        );
        Ok(())
    }
}

/// POSTs downlinks as JSON to a network server webhook.
#[derive(Clone)]
pub struct HttpDownlinker {
    url: String,
    client: reqwest::Client,
}

impl HttpDownlinker {
    pub fn new(url: &str) -> Self {
        HttpDownlinker {
            url: url.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Downlinker for HttpDownlinker {
    async fn send(&self, device_id: &str, downlink: &Downlink) -> Result<()> {
        let payload = json!({
            "deviceId": device_id,
            "port": downlink.port,
            "payloadHex": downlink.payload_hex(),
            "confirmed": downlink.confirmed,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| VsmError::Downlink(e.to_string()))?;
        if !response.status().is_success() {
            return Err(VsmError::Downlink(format!(
                "network server returned {}",
                response.status()
            )));
        }

        debug!(device = device_id, port = downlink.port, "downlink accepted");
        Ok(())
    }
}

/// Send almanac frames in order, pausing `pacing` between frames.
///
/// Each send must be accepted before the next is issued. The first failure
/// aborts the remaining frames. Returns the number of frames sent.
pub async fn deliver_almanac(
    downlinker: &dyn Downlinker,
    device_id: &str,
    frames: &[Downlink],
    pacing: Duration,
) -> Result<usize> {
    let total = frames.len();
    for (i, frame) in frames.iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(pacing).await;
        }
        downlinker.send(device_id, frame).await.map_err(|e| {
            VsmError::ProtocolAbort(format!("almanac frame {} of {total}: {e}", i + 1))
        })?;
        info!(
            device = device_id,
            frame = i + 1,
            frames = total,
            tag = frame.tag().map(|t| t.name()),
            "almanac downlink enqueued"
        );
    }
    Ok(total)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
