//! Uplink processing: validate, translate, merge, run rules, persist, publish.
//!
//! [`UplinkProcessor`] is the composition root. It owns the collaborators
//! selected at startup and runs one uplink end to end; only almanac
//! downloads outlive the call.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use vsm_core::config::Config;
use vsm_core::state::EncodedData;
use vsm_core::{hex_decode, DeviceState, Downlink, Merge, Result, Update, VsmError};

use crate::downlink::Downlinker;
use crate::downloads::{AlmanacDownloads, DownloadOutcome};
use crate::pipeline::Pipeline;
use crate::publisher::Publisher;
use crate::solver::Solver;
use crate::store::{StateStore, StoreError};
use crate::translator::Translator;

/// One uplink as delivered by a network server integration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Uplink {
    #[serde(default)]
    pub device_id: String,
    pub port: Option<u8>,
    #[serde(default)]
    pub payload_hex: String,
    /// Network receipt time.
    pub timestamp: Option<DateTime<Utc>>,
    /// Reference position reported with the uplink.
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    /// Max downlink payload for the current data rate.
    pub max_size: Option<usize>,
    /// Decoded update, when decoding happened upstream.
    pub decoded: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Persisted and published.
    Stored(DeviceState),
    /// Device filtered out by the id prefix.
    Ignored,
    /// Translator had nothing new; nothing persisted.
    NoResult,
}

/// Collaborators chosen at startup.
pub struct Collaborators {
    pub store: Arc<dyn StateStore>,
    pub solver: Arc<dyn Solver>,
    pub downlinker: Arc<dyn Downlinker>,
    pub translator: Arc<dyn Translator>,
    pub publisher: Arc<dyn Publisher>,
}

pub struct UplinkProcessor {
    store: Arc<dyn StateStore>,
    translator: Arc<dyn Translator>,
    publisher: Arc<dyn Publisher>,
    downlinker: Arc<dyn Downlinker>,
    pipeline: Pipeline,
    device_prefix: Option<String>,
    distrust_network_time: bool,
}

impl UplinkProcessor {
    pub fn new(parts: Collaborators, config: &Config) -> (Self, mpsc::UnboundedReceiver<DownloadOutcome>) {
        let (downloads, outcomes) = AlmanacDownloads::new(
            parts.solver.clone(),
            parts.downlinker.clone(),
            Duration::from_millis(config.downlink.pacing_ms),
        );
        let solver = if config.solver.disabled {
            None
        } else {
            Some(parts.solver)
        };
        let pipeline = Pipeline::new(
            solver,
            parts.downlinker.clone(),
            Arc::new(downloads),
            parts.translator.version(),
        )
        .with_clock_drift_threshold(config.rules.clock_drift_threshold_s)
        .with_default_max_size(config.rules.default_max_size);

        let processor = UplinkProcessor {
            store: parts.store,
            translator: parts.translator,
            publisher: parts.publisher,
            downlinker: parts.downlinker,
            pipeline,
            device_prefix: config.rules.device_prefix.clone(),
            distrust_network_time: config.rules.distrust_network_time,
        };
        (processor, outcomes)
    }

    pub fn downloads(&self) -> &Arc<AlmanacDownloads> {
        self.pipeline.downloads()
    }

    fn accepts(&self, device_id: &str) -> bool {
        match &self.device_prefix {
            Some(prefix) => device_id
                .to_ascii_uppercase()
                .starts_with(&prefix.to_ascii_uppercase()),
            None => true,
        }
    }

    /// Process one uplink end to end.
    pub async fn handle(&self, uplink: Uplink) -> Result<Outcome> {
        let (port, payload) = validate(&uplink)?;
        let device_id = uplink.device_id.as_str();

        if !self.accepts(device_id) {
            debug!(device = device_id, "ignoring unrecognized device");
            return Ok(Outcome::Ignored);
        }

        let event_time = match uplink.timestamp {
            Some(ts) if !self.distrust_network_time => ts,
            _ => Utc::now(),
        };
        info!(
            device = device_id,
            port,
            payload = %uplink.payload_hex,
            time = %event_time,
            lat = uplink.lat,
            lng = uplink.lng,
            "uplink"
        );

        let mut record = match self.store.fetch(device_id).await {
            Ok(state) => state,
            Err(StoreError::NotFound(_)) => {
                debug!(device = device_id, "no previous data");
                DeviceState::default()
            }
            Err(e) => return Err(e.into()),
        };
        record.encoded_data = Some(EncodedData {
            port,
            hex_encoded: vsm_core::hex_encode(&payload),
            timestamp: Some(event_time),
            max_size: uplink.max_size,
        });

        let result = match self.translator.translate(&record, uplink.decoded.as_ref()) {
            Ok(translation) => {
                if let Some(series) = &translation.timeseries {
                    debug!(device = device_id, timeseries = %series, "ignoring historical timeseries data");
                }
                translation.result
            }
            Err(e) => {
                error!(device = device_id, error = %e, "translation failed");
                if let Err(store_err) = self.store.put_error(device_id, &e.to_string()).await {
                    warn!(device = device_id, error = %store_err, "could not record translation error");
                }
                Some(Value::Object(Default::default()))
            }
        };
        let Some(result) = result else {
            warn!(device = device_id, "no new results from translator");
            return Ok(Outcome::NoResult);
        };

        let update = Update::from_value(&result)?;
        let patch = DeviceState::from_value(result.clone())?;
        record.merge(patch);

        let next = self
            .pipeline
            .apply(device_id, record, &update, event_time, uplink.lat, uplink.lng)
            .await;

        self.store.put(device_id, &next, &result).await?;
        self.publisher.publish(device_id, &next);
        Ok(Outcome::Stored(next))
    }

    /// Send an operator-supplied downlink.
    pub async fn send_downlink(&self, device_id: &str, port: u8, payload_hex: &str, confirmed: bool) -> Result<()> {
        if device_id.is_empty() {
            return Err(VsmError::Validation("device id is required".into()));
        }
        if port == 0 || port > 223 {
            return Err(VsmError::Validation("port must be 1-223".into()));
        }
        let payload = hex_decode(payload_hex)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| VsmError::InvalidHex(payload_hex.to_string()))?;

        self.downlinker
            .send(device_id, &Downlink::raw(port, payload, confirmed))
            .await
    }

    pub fn cancel_almanac(&self, device_id: &str) -> bool {
        self.downloads().cancel(device_id)
    }
}

fn validate(uplink: &Uplink) -> Result<(u8, Vec<u8>)> {
    if uplink.device_id.trim().is_empty() {
        return Err(VsmError::Validation("device id is required".into()));
    }
    let port = uplink
        .port
        .ok_or_else(|| VsmError::Validation("port is required".into()))?;
    let payload =
        hex_decode(&uplink.payload_hex).ok_or_else(|| VsmError::InvalidHex(uplink.payload_hex.clone()))?;
    Ok((port, payload))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
