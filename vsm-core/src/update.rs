//! Typed view of one translated uplink.
//!
//! The translator returns loosely structured JSON. The rules only look at
//! a handful of fragments; everything is merged into the device state
//! separately (see [`crate::state`]).

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::types::{Result, VsmError};

/// Message type tag of a WiFi scan in `semtechEncoded`.
pub const MSGTYPE_WIFI: &str = "wifi";

/// GNSS fragment of an update.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GnssUpdate {
    /// Device clock at capture.
    pub device_time: Option<DateTime<Utc>>,
    /// Network receipt time of the same uplink.
    pub device_time_timestamp: Option<DateTime<Utc>>,
    /// Raw GNSS scan, present when the uplink carried one.
    pub complete_hex: Option<String>,
}

/// Decoded uplink, as far as the rules are concerned.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Update {
    pub gnss: Option<GnssUpdate>,
    pub semtech_encoded: Option<Map<String, Value>>,
    pub semtech_gps_encoded: Option<Map<String, Value>>,
    pub wifi: Option<Map<String, Value>>,
}

impl Update {
    pub fn from_value(value: &Value) -> Result<Self> {
        Update::deserialize(value)
            .map_err(|e| VsmError::Validation(format!("malformed update: {e}")))
    }

    /// `msgtype` tag of the semtech-encoded fragment.
    pub fn msgtype(&self) -> Option<&str> {
        self.semtech_encoded
            .as_ref()
            .and_then(|s| s.get("msgtype"))
            .and_then(Value::as_str)
    }

    pub fn has_wifi_scan(&self) -> bool {
        self.msgtype() == Some(MSGTYPE_WIFI)
    }

    pub fn has_gnss_scan(&self) -> bool {
        self.gnss
            .as_ref()
            .is_some_and(|g| g.complete_hex.is_some())
    }

    /// Device clock sample as `(device_time, receipt_time)`.
    pub fn clock_sample(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let gnss = self.gnss.as_ref()?;
        Some((gnss.device_time?, gnss.device_time_timestamp?))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
