//! Payload translation: raw uplink + previous record -> update.
//!
//! The production translator lives outside this crate. The bundled
//! [`PassthroughTranslator`] accepts updates that were already decoded
//! upstream and carried alongside the raw payload.

use serde_json::{Map, Value};

use vsm_core::{DeviceState, Result, VsmError};

/// Translator output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Translation {
    /// Update to merge; `None` when the uplink produced nothing new.
    pub result: Option<Value>,
    /// Historical measurements reported in the same uplink.
    pub timeseries: Option<Value>,
}

pub trait Translator: Send + Sync {
    /// Stamped into every record as `vsm.translatorVersion`.
    fn version(&self) -> &str;

    /// Translate the uplink recorded in `record.encodedData`.
    fn translate(&self, record: &DeviceState, decoded: Option<&Value>) -> Result<Translation>;
}

pub struct PassthroughTranslator {
    version: String,
}

impl Default for PassthroughTranslator {
    fn default() -> Self {
        PassthroughTranslator {
            version: format!("passthrough-{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Translator for PassthroughTranslator {
    fn version(&self) -> &str {
        &self.version
    }

    fn translate(&self, _record: &DeviceState, decoded: Option<&Value>) -> Result<Translation> {
        let mut result = match decoded {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(other) => {
                return Err(VsmError::Validation(format!(
                    "decoded update must be an object, got {other}"
                )))
            }
        };
        let timeseries = result.remove("timeseries");

        Ok(Translation {
            result: Some(Value::Object(result)),
            timeseries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_passthrough_object() {
        let t = PassthroughTranslator::default();
        let decoded = json!({"temperature": 21.5, "timeseries": [{"t": 1}]});
        let out = t.translate(&DeviceState::default(), Some(&decoded)).unwrap();
        assert_eq!(out.result, Some(json!({"temperature": 21.5})));
        assert_eq!(out.timeseries, Some(json!([{"t": 1}])));
    }

    #[test]
    fn test_passthrough_missing_is_empty_update() {
        let t = PassthroughTranslator::default();
        let out = t.translate(&DeviceState::default(), None).unwrap();
        assert_eq!(out.result, Some(json!({})));
        assert!(out.timeseries.is_none());
    }

    #[test]
    fn test_passthrough_rejects_non_object() {
        let t = PassthroughTranslator::default();
        assert!(t.translate(&DeviceState::default(), Some(&json!([1, 2]))).is_err());
    }

    #[test]
    fn test_version() {
        assert!(PassthroughTranslator::default().version().starts_with("passthrough-"));
    }
}
