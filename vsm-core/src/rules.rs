//! Pure decisions behind the per-uplink rules.
//!
//! The async pipeline in vsm-server owns the side effects (solver calls,
//! downlinks, background tasks); everything here is a function of state,
//! update and clock so it can be tested without a runtime.

use chrono::{DateTime, Duration, Utc};

use crate::state::{DeviceState, GnssState};
use crate::update::Update;

/// Minimum time between assistance position downlinks.
///
/// At 300 km/h a device moves at most 150 km in this window, which the
/// firmware tolerates for its GNSS search window.
pub const ASSISTANCE_INTERVAL_S: i64 = 60 * 30;

/// Assistance position is refreshed when either axis moves further than this.
pub const ASSISTANCE_TOLERANCE_DEG: f64 = 0.1;

/// Almanac older than this is replaced.
pub const MAX_ALMANAC_AGE_S: i64 = 60 * 60 * 24 * 30;

/// Minimum time between almanac download attempts.
pub const ALMANAC_DOWNLOAD_INTERVAL_S: i64 = 60 * 60 * 12;

/// Default absolute clock drift that triggers a correction.
pub const DEFAULT_CLOCK_DRIFT_THRESHOLD_S: f64 = 5.0;

/// The device has not told us which rule set it runs.
pub fn needs_status_request(state: &DeviceState) -> bool {
    state.rules_crc32().is_none()
}

/// Device clock drift in seconds (`receipt - device`), if sampled.
pub fn clock_drift(update: &Update) -> Option<f64> {
    let (device, receipt) = update.clock_sample()?;
    Some((receipt - device).num_milliseconds() as f64 / 1000.0)
}

/// Clock correction to send, in whole seconds.
///
/// Fires when the absolute drift reaches `threshold_s`.
pub fn clock_correction(update: &Update, threshold_s: f64) -> Option<i32> {
    let drift = clock_drift(update)?;
    if drift.abs() < threshold_s {
        return None;
    }
    Some(crate::types::round_half_up(drift) as i32)
}

/// Whether an assistance position at (`lat`, `lng`) should be downlinked.
///
/// Never more often than [`ASSISTANCE_INTERVAL_S`]; otherwise when no
/// assistance position is known or either axis is off by more than
/// [`ASSISTANCE_TOLERANCE_DEG`].
pub fn assistance_required(gnss: &GnssState, lat: f64, lng: f64, now: DateTime<Utc>) -> bool {
    if let Some(last) = gnss.last_assistance_update_attempt {
        if now - last < Duration::seconds(ASSISTANCE_INTERVAL_S) {
            return false;
        }
    }

    let off = |stored: Option<f64>, observed: f64| match stored {
        Some(s) => (observed - s).abs() > ASSISTANCE_TOLERANCE_DEG,
        None => true,
    };
    off(gnss.assistance_latitude, lat) || off(gnss.assistance_longitude, lng)
}

/// Whether a new almanac download should be attempted now.
///
/// Requires a reported almanac timestamp older than [`MAX_ALMANAC_AGE_S`]
/// and no attempt within [`ALMANAC_DOWNLOAD_INTERVAL_S`].
pub fn almanac_download_due(gnss: &GnssState, now: DateTime<Utc>) -> bool {
    let Some(almanac_ts) = gnss.almanac_timestamp else {
        return false;
    };
    if now - almanac_ts < Duration::seconds(MAX_ALMANAC_AGE_S) {
        return false;
    }
    match gnss.last_almanac_download_attempt {
        Some(last) => now - last >= Duration::seconds(ALMANAC_DOWNLOAD_INTERVAL_S),
        None => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::VsmState;
    use chrono::TimeZone;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn gnss_at(lat: f64, lng: f64) -> GnssState {
        GnssState {
            assistance_latitude: Some(lat),
            assistance_longitude: Some(lng),
            ..Default::default()
        }
    }

    #[test]
    fn test_status_request_when_crc_missing() {
        assert!(needs_status_request(&DeviceState::default()));
        let known = DeviceState::vsm_patch(VsmState {
            rules_crc32: Some(0xDEAD),
            ..Default::default()
        });
        assert!(!needs_status_request(&known));
    }

    #[test]
    fn test_clock_correction_threshold() {
        let update = |device: &str, receipt: &str| {
            Update::from_value(&json!({
                "gnss": {"deviceTime": device, "deviceTimeTimestamp": receipt}
            }))
            .unwrap()
        };

        let late = update("2024-06-01T12:00:00Z", "2024-06-01T12:00:42Z");
        assert_eq!(clock_drift(&late), Some(42.0));
        assert_eq!(clock_correction(&late, 5.0), Some(42));

        let ahead = update("2024-06-01T12:01:00Z", "2024-06-01T12:00:00Z");
        assert_eq!(clock_correction(&ahead, 5.0), Some(-60));

        let close = update("2024-06-01T12:00:00Z", "2024-06-01T12:00:04.900Z");
        assert_eq!(clock_correction(&close, 5.0), None);

        let edge = update("2024-06-01T12:00:00Z", "2024-06-01T12:00:05Z");
        assert_eq!(clock_correction(&edge, 5.0), Some(5));

        assert_eq!(clock_correction(&Update::default(), 5.0), None);
    }

    #[test]
    fn test_assistance_when_missing() {
        assert!(assistance_required(&GnssState::default(), 46.5, 6.9, t0()));

        let only_lat = GnssState {
            assistance_latitude: Some(46.5),
            ..Default::default()
        };
        assert!(assistance_required(&only_lat, 46.5, 6.9, t0()));
    }

    #[test]
    fn test_assistance_tolerance() {
        let gnss = gnss_at(46.5, 6.9);
        assert!(!assistance_required(&gnss, 46.55, 6.95, t0()));
        assert!(assistance_required(&gnss, 46.65, 6.9, t0()));
        assert!(assistance_required(&gnss, 46.5, 6.75, t0()));
    }

    #[test]
    fn test_assistance_rate_limited() {
        let mut gnss = gnss_at(10.0, 10.0);
        gnss.last_assistance_update_attempt = Some(t0() - Duration::minutes(29));
        // Far away, but attempted recently
        assert!(!assistance_required(&gnss, 46.5, 6.9, t0()));

        gnss.last_assistance_update_attempt = Some(t0() - Duration::minutes(30));
        assert!(assistance_required(&gnss, 46.5, 6.9, t0()));
    }

    #[test]
    fn test_almanac_needs_timestamp() {
        assert!(!almanac_download_due(&GnssState::default(), t0()));
    }

    #[test]
    fn test_almanac_fresh() {
        let gnss = GnssState {
            almanac_timestamp: Some(t0() - Duration::days(29)),
            ..Default::default()
        };
        assert!(!almanac_download_due(&gnss, t0()));
    }

    #[test]
    fn test_almanac_stale_first_attempt() {
        let gnss = GnssState {
            almanac_timestamp: Some(t0() - Duration::days(30)),
            ..Default::default()
        };
        assert!(almanac_download_due(&gnss, t0()));
    }

    #[test]
    fn test_almanac_attempt_rate_limited() {
        let mut gnss = GnssState {
            almanac_timestamp: Some(t0() - Duration::days(90)),
            last_almanac_download_attempt: Some(t0() - Duration::hours(11)),
            ..Default::default()
        };
        assert!(!almanac_download_due(&gnss, t0()));

        gnss.last_almanac_download_attempt = Some(t0() - Duration::hours(12));
        assert!(almanac_download_due(&gnss, t0()));
    }
}
