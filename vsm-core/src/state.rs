//! Device state record: the per-device document merged across uplinks.
//!
//! Merge rules, applied by [`Merge::merge`] with the newer value as `patch`:
//!
//! - Scalar and array fields: overwrite when the patch carries a value.
//! - `gnss`, `vsm`: recurse field by field.
//! - `encodedData`: replaced as a whole (it always describes one uplink).
//! - Unknown keys (`extra`): JSON deep merge, objects recurse, anything
//!   else is overwritten.
//!
//! A patch can set a field but never clear it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{Result, VsmError};

/// Combine a newer partial value into `self`.
pub trait Merge {
    fn merge(&mut self, patch: Self);
}

fn overwrite<T>(slot: &mut Option<T>, patch: Option<T>) {
    if patch.is_some() {
        *slot = patch;
    }
}

fn merge_block<T: Merge>(slot: &mut Option<T>, patch: Option<T>) {
    if let Some(p) = patch {
        match slot.as_mut() {
            Some(current) => current.merge(p),
            None => *slot = Some(p),
        }
    }
}

/// Deep merge of loosely typed JSON objects.
pub fn merge_json(target: &mut Map<String, Value>, patch: Map<String, Value>) {
    for (key, value) in patch {
        if let Value::Object(patch_obj) = value {
            if let Some(Value::Object(existing)) = target.get_mut(&key) {
                merge_json(existing, patch_obj);
                continue;
            }
            target.insert(key, Value::Object(patch_obj));
        } else {
            target.insert(key, value);
        }
    }
}

// ---------------------------------------------------------------------------
// Sub-records
// ---------------------------------------------------------------------------

/// GNSS bookkeeping: assistance position and almanac freshness.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GnssState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistance_latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistance_longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_assistance_update_attempt: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub almanac_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_almanac_download_attempt: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Merge for GnssState {
    fn merge(&mut self, patch: Self) {
        overwrite(&mut self.assistance_latitude, patch.assistance_latitude);
        overwrite(&mut self.assistance_longitude, patch.assistance_longitude);
        overwrite(
            &mut self.last_assistance_update_attempt,
            patch.last_assistance_update_attempt,
        );
        overwrite(&mut self.almanac_timestamp, patch.almanac_timestamp);
        overwrite(
            &mut self.last_almanac_download_attempt,
            patch.last_almanac_download_attempt,
        );
        merge_json(&mut self.extra, patch.extra);
    }
}

/// Application metadata reported by (or stamped for) the device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VsmState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules_crc32: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translator_version: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Merge for VsmState {
    fn merge(&mut self, patch: Self) {
        overwrite(&mut self.rules_crc32, patch.rules_crc32);
        overwrite(&mut self.translator_version, patch.translator_version);
        merge_json(&mut self.extra, patch.extra);
    }
}

/// Last raw uplink as received from the network.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EncodedData {
    pub port: u8,
    pub hex_encoded: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size: Option<usize>,
}

// ---------------------------------------------------------------------------
// DeviceState
// ---------------------------------------------------------------------------

/// Durable per-device document. Also used as the patch type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gnss: Option<GnssState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vsm: Option<VsmState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoded_data: Option<EncodedData>,

    // Last solved position
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub algorithm_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,

    /// Everything else the translator reports (sensor readings etc).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Merge for DeviceState {
    fn merge(&mut self, patch: Self) {
        merge_block(&mut self.gnss, patch.gnss);
        merge_block(&mut self.vsm, patch.vsm);
        overwrite(&mut self.encoded_data, patch.encoded_data);
        overwrite(&mut self.latitude, patch.latitude);
        overwrite(&mut self.longitude, patch.longitude);
        overwrite(&mut self.accuracy, patch.accuracy);
        overwrite(&mut self.altitude, patch.altitude);
        overwrite(&mut self.algorithm_type, patch.algorithm_type);
        overwrite(&mut self.position_timestamp, patch.position_timestamp);
        overwrite(&mut self.warnings, patch.warnings);
        overwrite(&mut self.errors, patch.errors);
        merge_json(&mut self.extra, patch.extra);
    }
}

impl DeviceState {
    /// Parse a stored document or translator result.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| VsmError::Validation(format!("malformed device state: {e}")))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Patch that only touches the `gnss` block.
    pub fn gnss_patch(gnss: GnssState) -> Self {
        DeviceState {
            gnss: Some(gnss),
            ..Default::default()
        }
    }

    /// Patch that only touches the `vsm` block.
    pub fn vsm_patch(vsm: VsmState) -> Self {
        DeviceState {
            vsm: Some(vsm),
            ..Default::default()
        }
    }

    pub fn rules_crc32(&self) -> Option<u32> {
        self.vsm.as_ref().and_then(|v| v.rules_crc32)
    }

    /// Network max payload size recorded with the last uplink.
    pub fn max_size(&self) -> Option<usize> {
        self.encoded_data.as_ref().and_then(|e| e.max_size)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
