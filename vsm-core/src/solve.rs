//! Position solve requests and responses.
//!
//! Request preparation is pure: it picks the endpoint family from the
//! update, strips fields the solver rejects, and rejects WiFi scans that
//! cannot be solved before any network traffic happens.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::state::DeviceState;
use crate::update::Update;

/// Minimum access points for a WiFi solve.
pub const MIN_WIFI_ACCESS_POINTS: usize = 2;

/// Solver endpoint family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveKind {
    Wifi,
    Gnss,
}

impl SolveKind {
    /// Path below the solver base URL.
    pub fn endpoint(self) -> &'static str {
        match self {
            SolveKind::Wifi => "/api/v1/solve/loraWifi",
            SolveKind::Gnss => "/api/v1/solve/gnss_lora_edge_singleframe",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SolveKind::Wifi => "wifi",
            SolveKind::Gnss => "gnss",
        }
    }
}

/// A scan fragment bound for the solver.
#[derive(Debug, Clone, PartialEq)]
pub struct SolveRequest {
    pub kind: SolveKind,
    pub body: Map<String, Value>,
}

impl SolveRequest {
    /// Build a request from an update carrying a WiFi or GNSS scan.
    ///
    /// WiFi scans are sent from the `wifi` fragment; GNSS scans from
    /// `semtechEncoded`, falling back to `semtechGpsEncoded`. Returns `None`
    /// when there is nothing to send.
    pub fn from_update(update: &Update) -> Option<SolveRequest> {
        if update.has_wifi_scan() {
            return Some(SolveRequest {
                kind: SolveKind::Wifi,
                body: update.wifi.clone().unwrap_or_default(),
            });
        }
        if update.has_gnss_scan() {
            let body = update
                .semtech_encoded
                .clone()
                .or_else(|| update.semtech_gps_encoded.clone())?;
            return Some(SolveRequest {
                kind: SolveKind::Gnss,
                body,
            });
        }
        None
    }

    /// Normalize the outgoing body.
    ///
    /// `Err` carries a locally synthesized error response for scans the
    /// solver could not use anyway.
    pub fn prepare(&self) -> Result<Map<String, Value>, SolveResponse> {
        let mut body = self.body.clone();
        body.remove("msgtype");
        body.remove("timestamp");

        if self.kind == SolveKind::Wifi {
            let count = body
                .get("wifiAccessPoints")
                .and_then(Value::as_array)
                .map(Vec::len);
            if count.unwrap_or(0) < MIN_WIFI_ACCESS_POINTS {
                let seen = count.map_or("none".to_string(), |n| n.to_string());
                return Err(SolveResponse::error(format!(
                    "Too few access points to solve position ({seen})"
                )));
            }
            // TODO: drop once integrations forward real gateway metadata
            if !body.contains_key("lorawan") {
                body.insert("lorawan".into(), fallback_gateways());
            }
        }

        Ok(body)
    }
}

/// Reception records used when the integration supplies none.
pub fn fallback_gateways() -> Value {
    let gw_a = json!({"latitude": 46.98886, "longitude": 6.91287, "altitude": 513});
    let gw_b = json!({"latitude": 46.983753, "longitude": 6.906008, "altitude": 479});
    json!([
        {"gatewayId": "00-00-E4-77-6B-00-1A-5D", "antennaId": 0, "rssi": -86.0, "snr": 15.0, "toa": 10000, "antennaLocation": gw_a},
        {"gatewayId": "00-00-E4-77-6B-00-1A-5D", "antennaId": 1, "rssi": -87.0, "snr": 15.0, "toa": 5000, "antennaLocation": gw_a},
        {"gatewayId": "00-00-E4-77-6B-00-1A-97", "antennaId": 0, "rssi": -89.0, "snr": 15.0, "toa": 8000, "antennaLocation": gw_b},
        {"gatewayId": "00-00-E4-77-6B-00-1A-97", "antennaId": 1, "rssi": -89.0, "snr": 10.0, "toa": 20000, "antennaLocation": gw_b},
    ])
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Solved position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SolveResult {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub accuracy: Option<f64>,
    pub altitude: Option<f64>,
    pub algorithm_type: Option<String>,
    pub position_timestamp: Option<DateTime<Utc>>,
    /// Solver extras such as gateway counts.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Solver response envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolveResponse {
    pub result: Option<SolveResult>,
    pub warnings: Option<Vec<String>>,
    pub errors: Option<Vec<String>>,
}

impl SolveResponse {
    /// Locally synthesized failure.
    pub fn error(message: String) -> Self {
        SolveResponse {
            result: None,
            warnings: None,
            errors: Some(vec![message]),
        }
    }

    /// Replace a WiFi response whose algorithm is not from the WiFi family
    /// with an error.
    pub fn require_wifi_algorithm(self) -> Self {
        match self.result.as_ref().and_then(|r| r.algorithm_type.as_deref()) {
            Some(algo) if !algo.starts_with("Wifi") => {
                SolveResponse::error(format!("Got wrong type of response: {algo}"))
            }
            _ => self,
        }
    }

    /// Timestamp a solved position locally.
    pub fn stamp(mut self, now: DateTime<Utc>) -> Self {
        if let Some(result) = self.result.as_mut() {
            if result.latitude.is_some() {
                result.position_timestamp = Some(now);
            }
        }
        self
    }

    /// State patch for a response that carries a result.
    pub fn into_patch(self) -> Option<DeviceState> {
        let result = self.result?;
        Some(DeviceState {
            latitude: result.latitude,
            longitude: result.longitude,
            accuracy: result.accuracy,
            altitude: result.altitude,
            algorithm_type: result.algorithm_type,
            position_timestamp: result.position_timestamp,
            warnings: self.warnings.filter(|w| !w.is_empty()),
            errors: self.errors.filter(|e| !e.is_empty()),
            extra: result.extra,
            ..Default::default()
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
